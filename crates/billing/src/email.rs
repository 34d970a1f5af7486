//! Transactional billing notifications
//!
//! Every plan change and grace-period transition produces a [`Notification`].
//! Delivery goes through a [`Notifier`] and is always best effort: the
//! [`NotificationDispatcher`] logs failures and timeouts and never reports
//! them back to the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::models::{Overage, UserContact};

const RESEND_API_URL: &str = "https://api.resend.com/emails";

/// Formats a timestamp the way notifications show it, e.g. "March 15, 2026".
pub fn format_date(at: OffsetDateTime) -> String {
    at.format(format_description!(
        "[month repr:long] [day padding:none], [year]"
    ))
    .unwrap_or_else(|_| at.date().to_string())
}

fn overage_list(overages: &[Overage]) -> String {
    overages
        .iter()
        .map(|o| {
            format!(
                "{}: {} in use, new limit {} ({} over)",
                o.feature_code, o.current, o.new_limit, o.overage
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn grace_notice(grace_period_end: &str) -> String {
    if grace_period_end.is_empty() {
        return String::new();
    }
    format!(
        "\n\nItems over the new limits stay usable until {}.",
        grace_period_end
    )
}

/// A billing email, with the variables its template needs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Notification {
    PlanUpgraded {
        user_name: String,
        previous_plan: String,
        new_plan: String,
        price: String,
        next_billing_date: String,
        proration_amount: String,
    },
    PlanDowngradeScheduled {
        user_name: String,
        current_plan: String,
        new_plan: String,
        effective_date: String,
        overages: Vec<Overage>,
        /// Empty when no overage needs a grace period.
        grace_period_end: String,
    },
    /// A scheduled downgrade or cancellation took effect.
    PlanDowngradeApplied {
        user_name: String,
        previous_plan: String,
        new_plan: String,
        is_cancellation: bool,
        overages: Vec<Overage>,
        grace_period_end: String,
    },
    SubscriptionCancelled {
        user_name: String,
        plan: String,
        effective_date: String,
        reason: String,
    },
    GracePeriodWarning {
        user_name: String,
        days_remaining: i64,
        grace_period_end: String,
        overages: Vec<Overage>,
    },
    GracePeriodExpired {
        user_name: String,
        plan: String,
        overages: Vec<Overage>,
    },
}

impl Notification {
    pub fn template_name(&self) -> &'static str {
        match self {
            Notification::PlanUpgraded { .. } => "plan-upgraded",
            Notification::PlanDowngradeScheduled { .. } => "plan-downgrade-scheduled",
            Notification::PlanDowngradeApplied { .. } => "plan-downgrade-applied",
            Notification::SubscriptionCancelled { .. } => "subscription-cancelled",
            Notification::GracePeriodWarning { .. } => "grace-period-warning",
            Notification::GracePeriodExpired { .. } => "grace-period-expired",
        }
    }

    /// Template variables. Overage lists are sent both structured
    /// (`overages`) and pre-rendered (`overage_list`).
    pub fn variables(&self) -> serde_json::Value {
        match self {
            Notification::PlanUpgraded {
                user_name,
                previous_plan,
                new_plan,
                price,
                next_billing_date,
                proration_amount,
            } => json!({
                "user_name": user_name,
                "previous_plan": previous_plan,
                "new_plan": new_plan,
                "price": price,
                "next_billing_date": next_billing_date,
                "proration_amount": proration_amount,
            }),
            Notification::PlanDowngradeScheduled {
                user_name,
                current_plan,
                new_plan,
                effective_date,
                overages,
                grace_period_end,
            } => json!({
                "user_name": user_name,
                "current_plan": current_plan,
                "new_plan": new_plan,
                "effective_date": effective_date,
                "overages": overages,
                "overage_list": overage_list(overages),
                "grace_period_end": grace_period_end,
                "grace_notice": grace_notice(grace_period_end),
            }),
            Notification::PlanDowngradeApplied {
                user_name,
                previous_plan,
                new_plan,
                is_cancellation,
                overages,
                grace_period_end,
            } => json!({
                "user_name": user_name,
                "previous_plan": previous_plan,
                "new_plan": new_plan,
                "is_cancellation": is_cancellation,
                "overages": overages,
                "overage_list": overage_list(overages),
                "grace_period_end": grace_period_end,
                "grace_notice": grace_notice(grace_period_end),
            }),
            Notification::SubscriptionCancelled {
                user_name,
                plan,
                effective_date,
                reason,
            } => json!({
                "user_name": user_name,
                "plan": plan,
                "effective_date": effective_date,
                "reason": reason,
            }),
            Notification::GracePeriodWarning {
                user_name,
                days_remaining,
                grace_period_end,
                overages,
            } => json!({
                "user_name": user_name,
                "days_remaining": days_remaining,
                "grace_period_end": grace_period_end,
                "overages": overages,
                "overage_list": overage_list(overages),
            }),
            Notification::GracePeriodExpired {
                user_name,
                plan,
                overages,
            } => json!({
                "user_name": user_name,
                "plan": plan,
                "overages": overages,
                "overage_list": overage_list(overages),
            }),
        }
    }
}

/// Subject and plain-text body for a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub text: String,
}

fn template_source(template: &str) -> Option<(&'static str, &'static str)> {
    let source = match template {
        "plan-upgraded" => (
            "You're now on {{new_plan}}",
            "Hi {{user_name}},\n\nYour plan changed from {{previous_plan}} to {{new_plan}} \
             ({{price}}/month). Proration for the rest of this period: {{proration_amount}}.\n\
             Next billing date: {{next_billing_date}}.",
        ),
        "plan-downgrade-scheduled" => (
            "Your plan will change to {{new_plan}}",
            "Hi {{user_name}},\n\nYou stay on {{current_plan}} until {{effective_date}}, \
             then move to {{new_plan}}.\n\n{{overage_list}}{{grace_notice}}",
        ),
        "plan-downgrade-applied" => (
            "You're now on {{new_plan}}",
            "Hi {{user_name}},\n\nYour plan changed from {{previous_plan}} to {{new_plan}}.\n\n\
             {{overage_list}}{{grace_notice}}",
        ),
        "subscription-cancelled" => (
            "Your {{plan}} subscription has been cancelled",
            "Hi {{user_name}},\n\nYour {{plan}} subscription stays active until \
             {{effective_date}}. You can reactivate any time before then.",
        ),
        "grace-period-warning" => (
            "{{days_remaining}} days left to reduce your usage",
            "Hi {{user_name}},\n\nYour grace period ends on {{grace_period_end}}. After that \
             you won't be able to add more of the following:\n\n{{overage_list}}",
        ),
        "grace-period-expired" => (
            "Your grace period has ended",
            "Hi {{user_name}},\n\nThe limits of your {{plan}} plan now apply to:\n\n\
             {{overage_list}}\n\nExisting items are kept. Upgrade to add more.",
        ),
        _ => return None,
    };
    Some(source)
}

fn substitute(source: &str, variables: &serde_json::Value) -> String {
    let mut out = source.to_string();
    if let Some(map) = variables.as_object() {
        for (key, value) in map {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                _ => continue,
            };
            out = out.replace(&format!("{{{{{}}}}}", key), &text);
        }
    }
    out
}

pub fn render(template: &str, variables: &serde_json::Value) -> BillingResult<RenderedEmail> {
    let (subject, text) = template_source(template)
        .ok_or_else(|| BillingError::Notification(format!("Unknown template '{}'", template)))?;
    Ok(RenderedEmail {
        subject: substitute(subject, variables),
        text: substitute(text, variables).trim_end().to_string(),
    })
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_template(
        &self,
        template: &str,
        recipient: &str,
        variables: &serde_json::Value,
    ) -> BillingResult<()>;
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub resend_api_key: Option<String>,
    pub from: String,
    pub app_url: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            resend_api_key: None,
            from: "Fintrack <billing@fintrack.app>".to_string(),
            app_url: "http://localhost:3000".to_string(),
        }
    }
}

impl EmailConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            from: std::env::var("EMAIL_FROM").unwrap_or(defaults.from),
            app_url: std::env::var("APP_URL").unwrap_or(defaults.app_url),
        }
    }

    /// Resend when an API key is configured, otherwise log-only.
    pub fn build_notifier(&self) -> Arc<dyn Notifier> {
        match &self.resend_api_key {
            Some(key) => {
                tracing::info!("Billing notifications will be sent via Resend");
                Arc::new(ResendNotifier::new(
                    key.clone(),
                    self.from.clone(),
                    self.app_url.clone(),
                ))
            }
            None => {
                tracing::warn!("RESEND_API_KEY not set, billing notifications will only be logged");
                Arc::new(LogNotifier)
            }
        }
    }
}

pub struct ResendNotifier {
    client: reqwest::Client,
    api_key: String,
    from: String,
    app_url: String,
}

impl ResendNotifier {
    pub fn new(api_key: String, from: String, app_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            from,
            app_url,
        }
    }
}

#[async_trait]
impl Notifier for ResendNotifier {
    async fn send_template(
        &self,
        template: &str,
        recipient: &str,
        variables: &serde_json::Value,
    ) -> BillingResult<()> {
        let rendered = render(template, variables)?;
        let text = format!(
            "{}\n\nManage your plan: {}/settings/billing",
            rendered.text, self.app_url
        );

        let response = self
            .client
            .post(RESEND_API_URL)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "from": self.from,
                "to": [recipient],
                "subject": rendered.subject,
                "text": text,
                "tags": [{ "name": "template", "value": template }],
            }))
            .send()
            .await
            .map_err(|e| BillingError::Notification(format!("Failed to call Resend: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::Notification(format!(
                "Resend API error ({}): {}",
                status, body
            )));
        }
        Ok(())
    }
}

/// Logs instead of sending. Used when no provider is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_template(
        &self,
        template: &str,
        recipient: &str,
        variables: &serde_json::Value,
    ) -> BillingResult<()> {
        tracing::info!(
            template = template,
            recipient = recipient,
            variables = %variables,
            "Billing notification (log only)"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchMode {
    /// Each send runs on its own task.
    Background,
    /// The caller awaits the send (bounded by the timeout).
    Inline,
}

/// Fire-and-forget front of a [`Notifier`].
#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
    mode: DispatchMode,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, timeout: Duration) -> Self {
        Self {
            notifier,
            timeout,
            mode: DispatchMode::Background,
        }
    }

    /// Awaits each send in place. Used by batch jobs and tests so a run has
    /// finished its emails when it returns.
    pub fn inline(notifier: Arc<dyn Notifier>, timeout: Duration) -> Self {
        Self {
            notifier,
            timeout,
            mode: DispatchMode::Inline,
        }
    }

    pub fn with_inline_delivery(&self) -> Self {
        Self {
            mode: DispatchMode::Inline,
            ..self.clone()
        }
    }

    pub async fn dispatch(&self, recipient: &UserContact, notification: Notification) {
        let notifier = self.notifier.clone();
        let timeout = self.timeout;
        let recipient = recipient.clone();

        match self.mode {
            DispatchMode::Background => {
                tokio::spawn(async move {
                    deliver(notifier, timeout, recipient, notification).await;
                });
            }
            DispatchMode::Inline => deliver(notifier, timeout, recipient, notification).await,
        }
    }
}

async fn deliver(
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
    recipient: UserContact,
    notification: Notification,
) {
    let template = notification.template_name();
    let variables = notification.variables();

    let result = tokio::time::timeout(
        timeout,
        notifier.send_template(template, &recipient.email, &variables),
    )
    .await;

    match result {
        Ok(Ok(())) => {
            tracing::debug!(user_id = %recipient.user_id, template = template, "Notification sent");
        }
        Ok(Err(e)) => {
            tracing::warn!(
                user_id = %recipient.user_id,
                template = template,
                error = %e,
                "Failed to send billing notification"
            );
        }
        Err(_) => {
            tracing::warn!(
                user_id = %recipient.user_id,
                template = template,
                timeout_secs = timeout.as_secs(),
                "Billing notification timed out"
            );
        }
    }
}
