//! Applies the configured failure policy to the controller's webhook
//! registrations.

use crate::k8s::{
    Api, Client, MutatingWebhookConfiguration, PostParams, ValidatingWebhookConfiguration,
};
use std::{fmt, str::FromStr};
use tracing::{debug, info, warn};

/// How the API server treats requests when the webhook cannot be reached.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Admit writes while the webhook is down. Writes admitted this way are
    /// reported as drift by the ownership index.
    #[default]
    Ignore,
    Fail,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid failure policy {0:?}: expected Ignore or Fail")]
pub struct InvalidFailurePolicy(String);

// === impl FailurePolicy ===

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ignore => "Ignore",
            Self::Fail => "Fail",
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = InvalidFailurePolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("ignore") {
            return Ok(Self::Ignore);
        }
        if s.eq_ignore_ascii_case("fail") {
            return Ok(Self::Fail);
        }
        Err(InvalidFailurePolicy(s.to_string()))
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

/// Sets the failure policy of every webhook. Returns true if any changed.
pub fn set_validating(config: &mut ValidatingWebhookConfiguration, policy: FailurePolicy) -> bool {
    let mut changed = false;
    for webhook in config.webhooks.iter_mut().flatten() {
        changed |= set(&mut webhook.failure_policy, policy);
    }
    changed
}

/// Sets the failure policy of every webhook. Returns true if any changed.
pub fn set_mutating(config: &mut MutatingWebhookConfiguration, policy: FailurePolicy) -> bool {
    let mut changed = false;
    for webhook in config.webhooks.iter_mut().flatten() {
        changed |= set(&mut webhook.failure_policy, policy);
    }
    changed
}

fn set(current: &mut Option<String>, policy: FailurePolicy) -> bool {
    if current.as_deref() == Some(policy.as_str()) {
        return false;
    }
    *current = Some(policy.as_str().to_string());
    true
}

/// Updates the named webhook configurations. Failures are logged and
/// otherwise ignored so that a missing registration does not block startup.
pub async fn apply(client: Client, name: &str, policy: FailurePolicy) {
    let validating = Api::<ValidatingWebhookConfiguration>::all(client.clone());
    match validating.get_opt(name).await {
        Ok(Some(mut config)) => {
            if set_validating(&mut config, policy) {
                match validating
                    .replace(name, &PostParams::default(), &config)
                    .await
                {
                    Ok(_) => info!(%name, %policy, "Updated validating webhook failure policy"),
                    Err(error) => warn!(%name, %error, "Failed to update validating webhook"),
                }
            } else {
                debug!(%name, %policy, "Validating webhook failure policy is current");
            }
        }
        Ok(None) => warn!(%name, "Validating webhook configuration not found"),
        Err(error) => warn!(%name, %error, "Failed to get validating webhook configuration"),
    }

    let mutating = Api::<MutatingWebhookConfiguration>::all(client);
    match mutating.get_opt(name).await {
        Ok(Some(mut config)) => {
            if set_mutating(&mut config, policy) {
                match mutating
                    .replace(name, &PostParams::default(), &config)
                    .await
                {
                    Ok(_) => info!(%name, %policy, "Updated mutating webhook failure policy"),
                    Err(error) => warn!(%name, %error, "Failed to update mutating webhook"),
                }
            } else {
                debug!(%name, %policy, "Mutating webhook failure policy is current");
            }
        }
        Ok(None) => warn!(%name, "Mutating webhook configuration not found"),
        Err(error) => warn!(%name, %error, "Failed to get mutating webhook configuration"),
    }
}
