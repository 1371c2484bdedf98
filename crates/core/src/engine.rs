use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use chrono::Local;
use tracing::info;

use crate::error::EngineError;
use crate::lock::LockManager;
use crate::machine::Workflow;
use crate::monitor::Monitor;
use crate::orchestrator::Orchestrator;
use crate::perception::Perception;
use crate::platform::Collaborators;
use crate::scene::SceneRegistry;
use crate::scheduler::{fire, run_scheduler, TriggerOutcome};
use crate::session::SessionRunner;
use crate::settings::{Paths, Settings};
use crate::state::{CycleState, CycleStore, StopSignal};
use crate::types::AccountRecord;

/// Everything one configured instance needs, built once at startup.
pub struct Engine {
    settings: Arc<Settings>,
    paths: Paths,
    collab: Collaborators,
    workflow: Arc<Workflow>,
    perception: Arc<Perception>,
    accounts: Mutex<Vec<AccountRecord>>,
    lock: LockManager,
    stop: StopSignal,
    monitor: Monitor,
}

impl Engine {
    /// Load the scene registry from the anchors directory and resolve the
    /// workflow against it. Relative paths resolve against `base_dir`.
    pub fn new(settings: Settings, base_dir: &Path, collab: Collaborators) -> Result<Self, EngineError> {
        let paths = settings.paths.resolve(base_dir);
        let registry = SceneRegistry::load(&paths.anchors)?;
        Self::with_registry(settings, paths, collab, registry)
    }

    pub fn with_registry(
        settings: Settings,
        paths: Paths,
        collab: Collaborators,
        registry: SceneRegistry,
    ) -> Result<Self, EngineError> {
        let registry = Arc::new(registry);
        let workflow = Arc::new(Workflow::resolve(&settings.workflow, &registry)?);
        let perception = Arc::new(Perception::new(
            collab.platform.clone(),
            collab.recognizer.clone(),
            collab.clock.clone(),
            registry.clone(),
            &settings.flow,
        ));
        let accounts = settings.account_records();
        info!(
            scenes = registry.len(),
            steps = workflow.steps.len(),
            accounts = accounts.len(),
            "engine ready"
        );
        Ok(Self {
            lock: LockManager::new(&paths.lock),
            stop: StopSignal::new(&paths.stop_flag),
            settings: Arc::new(settings),
            paths,
            collab,
            workflow,
            perception,
            accounts: Mutex::new(accounts),
            monitor: Monitor::new(),
        })
    }

    pub fn monitor(&self) -> Monitor {
        self.monitor.clone()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Persisted state of the last cycle, if any.
    pub fn status(&self) -> Option<CycleState> {
        CycleStore::new(&self.paths.state).load()
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            CycleStore::new(&self.paths.state),
            self.stop.clone(),
            self.settings.flow.clone(),
            self.collab.clock.clone(),
            self.collab.evidence.clone(),
        )
        .with_monitor(self.monitor.clone())
    }

    /// One trigger: a full cycle under the execution lock.
    pub fn run_cycle(&self) -> TriggerOutcome {
        let outcome = fire(&self.lock, &self.stop, || {
            let mut accounts = self.accounts.lock().unwrap();
            let mut runner = SessionRunner::new(
                self.collab.clone(),
                self.settings.clone(),
                self.workflow.clone(),
                self.perception.clone(),
            );
            self.orchestrator().run_cycle(&mut accounts, &mut runner)
        });
        let label = match &outcome {
            TriggerOutcome::Busy => "busy".to_string(),
            TriggerOutcome::StopRequested => "stop requested".to_string(),
            TriggerOutcome::Ran(s) => format!("{:?}: {} ok, {} failed", s.status, s.succeeded, s.failed).to_lowercase(),
            TriggerOutcome::Failed(reason) => format!("failed: {}", reason),
        };
        info!(outcome = %label, "trigger finished");
        self.monitor.update(|v| v.last_trigger = Some((Local::now(), label)));
        outcome
    }

    /// Fire cycles on the configured schedule until `shutdown` is set.
    pub fn run_schedule(&self, shutdown: &AtomicBool) -> Result<(), EngineError> {
        if !self.settings.schedule.enabled {
            return Err(EngineError::Config("schedule.enabled is false".into()));
        }
        run_scheduler(&self.settings.schedule, shutdown, self.collab.clock.as_ref(), || {
            self.run_cycle();
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::AccountConfig;
    use crate::state::CycleStatus;
    use crate::testutil::*;
    use crate::types::AccountOutcome;

    fn account(name: &str) -> AccountConfig {
        AccountConfig { id: String::new(), username: name.into(), password: "pw".into(), enabled: true }
    }

    fn engine(h: &Harness, dir: &Path, mut settings: Settings) -> Engine {
        settings.accounts = vec![account("amy"), account("bob")];
        let paths = settings.paths.resolve(dir);
        Engine::with_registry(settings, paths, h.collab.clone(), client_registry()).unwrap()
    }

    #[test]
    fn cycle_runs_every_account() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness();
        install_client(&h.stub, "lobby");
        let e = engine(&h, dir.path(), client_settings());

        let TriggerOutcome::Ran(summary) = e.run_cycle() else { panic!("cycle did not run") };
        assert_eq!(summary.status, CycleStatus::Completed);
        assert_eq!(summary.attempted, vec!["amy", "bob"]);
        assert_eq!(h.stub.inspect(|d| d.logins.clone()), vec!["amy", "bob"]);
        assert_eq!(h.stub.inspect(|d| d.launches.len()), 2);

        let st = e.status().unwrap();
        assert_eq!((st.status, st.next_index, st.total), (CycleStatus::Completed, 3, 2));
        let view = e.monitor().snapshot();
        assert!(view.last_trigger.unwrap().1.starts_with("completed"));
        assert!(view.accounts.iter().all(|a| a.outcome == Some(AccountOutcome::Succeeded)));
        assert_eq!(h.evidence.count(), 0);
    }

    #[test]
    fn rejected_credentials_are_retried_then_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness();
        install_client(&h.stub, "lobby");
        h.stub.update(|d| {
            d.failing_logins.insert("amy".into());
        });
        let mut s = client_settings();
        s.flow.account_max_retry = 1;
        let e = engine(&h, dir.path(), s);

        let TriggerOutcome::Ran(summary) = e.run_cycle() else { panic!("cycle did not run") };
        assert_eq!((summary.succeeded, summary.failed), (1, 1));
        // two attempts, each logging in twice before the step gives up
        let amy = h.stub.inspect(|d| d.logins.iter().filter(|l| *l == "amy").count());
        assert_eq!(amy, 4);
        assert_eq!(h.evidence.count(), 2);
    }

    #[test]
    fn manual_policy_halts_and_keeps_client_for_operator() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness();
        install_client(&h.stub, "blank");
        let mut s = client_settings();
        s.flow.error_policy = crate::settings::ErrorPolicy::Manual;
        let e = engine(&h, dir.path(), s);

        let TriggerOutcome::Ran(summary) = e.run_cycle() else { panic!("cycle did not run") };
        assert_eq!(summary.status, CycleStatus::Manual);
        assert_eq!(summary.attempted, vec!["amy"]);
        let st = e.status().unwrap();
        assert_eq!((st.status, st.next_index), (CycleStatus::Manual, 0));
        assert_eq!(h.stub.inspect(|d| d.windows.len()), 1);
    }

    #[test]
    fn stop_flag_skips_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness();
        install_client(&h.stub, "lobby");
        let e = engine(&h, dir.path(), client_settings());
        e.stop_signal().request().unwrap();
        assert_eq!(e.run_cycle(), TriggerOutcome::StopRequested);
        assert!(e.status().is_none());
        e.stop_signal().clear().unwrap();
        assert!(matches!(e.run_cycle(), TriggerOutcome::Ran(_)));
    }

    #[test]
    fn disabled_schedule_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness();
        let e = engine(&h, dir.path(), client_settings());
        assert!(matches!(e.run_schedule(&AtomicBool::new(false)), Err(EngineError::Config(_))));
    }

    #[test]
    fn missing_anchors_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness();
        let err = Engine::new(client_settings(), dir.path(), h.collab.clone()).err().unwrap();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
