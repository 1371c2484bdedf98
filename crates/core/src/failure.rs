use tracing::error;

use crate::action::ClickAttemptResult;
use crate::error::EngineError;
use crate::platform::{Collaborators, FailureReport};
use crate::settings::ErrorPolicy;
use crate::types::WindowId;

/// Single exit point for exhausted retry budgets: records evidence once and
/// turns the failure into one of the two escalation outcomes.
pub struct FailureHandler<'a> {
    collab: &'a Collaborators,
    policy: ErrorPolicy,
    account: &'a str,
}

impl<'a> FailureHandler<'a> {
    pub fn new(collab: &'a Collaborators, policy: ErrorPolicy, account: &'a str) -> Self {
        Self { collab, policy, account }
    }

    /// Escalate according to the configured policy.
    pub fn escalate(&self, window: Option<WindowId>, stage: &str, reason: &str, attempts: &[ClickAttemptResult]) -> EngineError {
        self.escalate_as(self.policy, window, stage, reason, attempts)
    }

    /// Escalate with an explicit outcome regardless of policy.
    pub fn escalate_as(
        &self,
        policy: ErrorPolicy,
        window: Option<WindowId>,
        stage: &str,
        reason: &str,
        attempts: &[ClickAttemptResult],
    ) -> EngineError {
        error!(account = self.account, stage, reason, policy = ?policy, "escalating failure");
        let platform = &self.collab.platform;
        let screenshot = window
            .and_then(|w| platform.capture_region(w, None).ok())
            .map(|c| c.image);
        let report = FailureReport {
            tag: stage.to_string(),
            stage: stage.to_string(),
            reason: reason.to_string(),
            account: Some(self.account.to_string()),
            window: window.and_then(|w| platform.window_title(w)),
            attempts: attempts.to_vec(),
            stack_info: Some(format!("{}: {}", stage, reason)),
            screenshot,
            html: None,
        };
        self.collab.evidence.record_failure(&report);

        let message = format!("{}: {}", stage, reason);
        match policy {
            ErrorPolicy::Manual => EngineError::ManualInterventionRequired(message),
            ErrorPolicy::Restart => EngineError::Recoverable(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::stub::StubScreen;
    use crate::testutil::*;

    #[test]
    fn records_once_and_follows_policy() {
        let h = harness();
        h.stub.add_screen(StubScreen::new("a", noise(160, 120, 1)));
        let w = h.stub.open_window("Client", "client", WINDOW, "a");

        let restart = FailureHandler::new(&h.collab, ErrorPolicy::Restart, "amy");
        let e = restart.escalate(Some(w), "lobby", "scene_not_found", &[]);
        assert!(matches!(e, EngineError::Recoverable(ref m) if m == "lobby: scene_not_found"));
        assert_eq!(h.evidence.count(), 1);
        {
            let reports = h.evidence.reports.lock().unwrap();
            assert!(reports[0].screenshot.is_some());
            assert_eq!(reports[0].window.as_deref(), Some("Client"));
            assert_eq!(reports[0].account.as_deref(), Some("amy"));
        }

        let manual = FailureHandler::new(&h.collab, ErrorPolicy::Manual, "amy");
        assert!(manual.escalate(None, "login", "rejected", &[]).requires_operator());
        assert_eq!(h.evidence.count(), 2);
    }
}
