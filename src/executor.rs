//! The seam between the engine and the browser-automation collaborator.
//!
//! The engine owns scheduling, state and correlation; everything that
//! actually drives a profile lives behind [`AutomationExecutor`]. Executors
//! receive a [`VerificationContext`] so they can suspend on SMS codes and
//! observe cooperative cancellation without knowing how either works.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::correlation::{SmsCorrelator, SmsEvent};
use crate::error::AutomationFailure;

/// Descriptive snapshot of a browser profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileInfo {
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl ProfileInfo {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: None,
            group_id: None,
            group_name: None,
            status: None,
        }
    }
}

/// Resolves a profile reference to profile metadata before a job starts.
#[async_trait]
pub trait ProfileProvider: Send + Sync {
    async fn get_profile(&self, profile_ref: &str) -> Option<ProfileInfo>;
}

/// Runs the account-creation flow for one profile.
#[async_trait]
pub trait AutomationExecutor: Send + Sync {
    async fn run(
        &self,
        profile_ref: &str,
        params: &Value,
        ctx: &VerificationContext,
    ) -> Result<Value, AutomationFailure>;
}

/// Per-job handle the executor uses to wait for verification codes and to
/// honour cancellation between automation steps.
pub struct VerificationContext {
    pub(crate) correlator: Arc<SmsCorrelator>,
    pub(crate) cancel: CancellationToken,
    pub(crate) sms_wait: Duration,
}

impl VerificationContext {
    pub fn new(correlator: Arc<SmsCorrelator>, cancel: CancellationToken, sms_wait: Duration) -> Self {
        Self {
            correlator,
            cancel,
            sms_wait,
        }
    }

    /// Suspends until the webhook for `activation_id` arrives. Cancellation
    /// interrupts the wait; an expired wait becomes an `SmsTimeout` failure.
    pub async fn await_code(&self, activation_id: &str) -> Result<SmsEvent, AutomationFailure> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(AutomationFailure::Cancelled),
            outcome = self.correlator.await_code(activation_id, self.sms_wait) => {
                outcome.map_err(|_| AutomationFailure::SmsTimeout)
            }
        }
    }

    /// Cancellation checkpoint. Executors call this between steps so a
    /// cancelled job stops at the next step boundary.
    pub fn check_cancelled(&self) -> Result<(), AutomationFailure> {
        if self.cancel.is_cancelled() {
            Err(AutomationFailure::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Profile provider backed by a fixed set of known profile ids.
pub struct StaticProfiles {
    known: HashSet<String>,
}

impl StaticProfiles {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: ids.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ProfileProvider for StaticProfiles {
    async fn get_profile(&self, profile_ref: &str) -> Option<ProfileInfo> {
        self.known.contains(profile_ref).then(|| {
            let mut info = ProfileInfo::new(profile_ref);
            info.status = Some("Active".to_string());
            info
        })
    }
}

/// Accepts every profile reference. Useful when the upstream profile store
/// is trusted to only hand out valid ids.
pub struct AnyProfile;

#[async_trait]
impl ProfileProvider for AnyProfile {
    async fn get_profile(&self, profile_ref: &str) -> Option<ProfileInfo> {
        Some(ProfileInfo::new(profile_ref))
    }
}

/// Executor that fakes the account-creation flow with short sleeps. Drives
/// the demo binary and keeps integration tests away from real browsers.
pub struct SimulatedAutomation {
    pub step_delay: Duration,
}

impl SimulatedAutomation {
    pub fn new(step_delay: Duration) -> Self {
        Self { step_delay }
    }
}

impl Default for SimulatedAutomation {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

#[async_trait]
impl AutomationExecutor for SimulatedAutomation {
    async fn run(
        &self,
        profile_ref: &str,
        params: &Value,
        ctx: &VerificationContext,
    ) -> Result<Value, AutomationFailure> {
        // Browser startup, form filling, submission. Each step boundary is a
        // cancellation checkpoint.
        for step in ["open_browser", "fill_form", "submit"] {
            ctx.check_cancelled()?;
            tracing::debug!(profile_ref, step, "simulated automation step");
            tokio::time::sleep(self.step_delay).await;
        }

        // Phone verification only when the caller provided an activation id.
        let code = match params.get("activation_id").and_then(Value::as_str) {
            Some(activation_id) => Some(ctx.await_code(activation_id).await?.code),
            None => None,
        };

        ctx.check_cancelled()?;
        tokio::time::sleep(self.step_delay).await;

        Ok(json!({
            "profile_ref": profile_ref,
            "email": format!("{profile_ref}@example.com"),
            "verified": code.is_some(),
            "verification_code": code,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(correlator: Arc<SmsCorrelator>, cancel: CancellationToken) -> VerificationContext {
        VerificationContext::new(correlator, cancel, Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_run_without_verification() {
        let correlator = Arc::new(SmsCorrelator::new(Duration::from_secs(60)));
        let ctx = ctx(correlator, CancellationToken::new());
        let executor = SimulatedAutomation::default();

        let result = executor
            .run("profile-1", &json!({}), &ctx)
            .await
            .unwrap();
        assert_eq!(result["email"], "profile-1@example.com");
        assert_eq!(result["verified"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_run_waits_for_code() {
        let correlator = Arc::new(SmsCorrelator::new(Duration::from_secs(60)));
        correlator
            .resolve(SmsEvent::new("act-9", "90210"))
            .unwrap();

        let ctx = ctx(Arc::clone(&correlator), CancellationToken::new());
        let executor = SimulatedAutomation::default();
        let result = executor
            .run("profile-2", &json!({"activation_id": "act-9"}), &ctx)
            .await
            .unwrap();
        assert_eq!(result["verified"], true);
        assert_eq!(result["verification_code"], "90210");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_verification_wait() {
        let correlator = Arc::new(SmsCorrelator::new(Duration::from_secs(60)));
        let cancel = CancellationToken::new();
        let ctx = ctx(correlator, cancel.clone());

        let wait = tokio::spawn(async move { ctx.await_code("act-never").await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let outcome = wait.await.unwrap();
        assert!(matches!(outcome, Err(AutomationFailure::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn verification_wait_times_out() {
        let correlator = Arc::new(SmsCorrelator::new(Duration::from_secs(60)));
        let ctx = VerificationContext::new(
            correlator,
            CancellationToken::new(),
            Duration::from_millis(50),
        );
        let outcome = ctx.await_code("act-silent").await;
        assert!(matches!(outcome, Err(AutomationFailure::SmsTimeout)));
    }

    #[tokio::test]
    async fn static_profiles_membership() {
        let profiles = StaticProfiles::new(["p1", "p2"]);
        assert!(profiles.get_profile("p1").await.is_some());
        assert!(profiles.get_profile("p3").await.is_none());
    }
}
