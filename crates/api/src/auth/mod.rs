//! Identity module for the Fintrack API

pub mod middleware;
#[cfg(test)]
mod middleware_tests;

pub use middleware::{require_admin, require_identity, AuthError, AuthUser};
