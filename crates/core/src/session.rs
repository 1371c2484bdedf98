use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::clock::{millis, secs};
use crate::error::{BackendError, EngineError};
use crate::failure::FailureHandler;
use crate::machine::{SceneMachine, Workflow};
use crate::orchestrator::AccountRunner;
use crate::perception::Perception;
use crate::platform::{process_name, Collaborators};
use crate::settings::Settings;
use crate::types::{AccountRecord, WindowId};

/// One client session per account: bring the client up, drive the
/// workflow, shut the client down.
pub struct SessionRunner {
    collab: Collaborators,
    settings: Arc<Settings>,
    workflow: Arc<Workflow>,
    perception: Arc<Perception>,
}

impl SessionRunner {
    pub fn new(collab: Collaborators, settings: Arc<Settings>, workflow: Arc<Workflow>, perception: Arc<Perception>) -> Self {
        Self { collab, settings, workflow, perception }
    }

    fn failure<'a>(&'a self, account: &'a AccountRecord) -> FailureHandler<'a> {
        FailureHandler::new(&self.collab, self.settings.flow.error_policy, &account.id)
    }

    fn find_client(&self) -> Option<WindowId> {
        self.collab.platform.find_window(&self.workflow.window_title)
    }

    /// Reuse a running client or launch one, waiting a bounded time for its
    /// window.
    pub fn ensure_client(&self, account: &AccountRecord) -> Result<WindowId, EngineError> {
        if let Some(w) = self.find_client() {
            info!(window = w, "reusing client window");
            return Ok(w);
        }
        let Some(path) = self.workflow.launch.as_deref() else {
            return Err(self.failure(account).escalate(None, "launch", "client_not_running_and_no_launch_path", &[]));
        };

        let flow = &self.settings.flow;
        for attempt in 1..=flow.launch_retry.max(1) {
            info!(attempt, path = %path.display(), "launching client");
            match self.collab.platform.start_process(path) {
                Ok(()) => {}
                Err(e @ BackendError::Unavailable(_)) => return Err(e.into()),
                Err(e) => {
                    warn!(attempt, error = %e, "launch failed");
                    self.collab.clock.sleep(millis(flow.poll_interval_ms));
                    continue;
                }
            }
            if let Some(w) = self.wait_for(secs(flow.launch_wait_secs), |s| s.find_client()) {
                info!(window = w, "client window appeared");
                return Ok(w);
            }
            warn!(attempt, waited = flow.launch_wait_secs, "client window did not appear");
        }
        Err(self.failure(account).escalate(None, "launch", "client_launch_failed", &[]))
    }

    /// Poll `probe` every poll interval until it yields or `timeout` passes.
    fn wait_for<T>(&self, timeout: Duration, probe: impl Fn(&Self) -> Option<T>) -> Option<T> {
        let clock = &self.collab.clock;
        let started = clock.now();
        loop {
            if let Some(v) = probe(self) {
                return Some(v);
            }
            if clock.now().saturating_sub(started) >= timeout {
                return None;
            }
            clock.sleep(millis(self.settings.flow.poll_interval_ms));
        }
    }

    /// Close the client. Kills it when it will not go away and either `force`
    /// or `force_kill_on_exit_fail` is set.
    pub fn exit_client(&self, force: bool) {
        let platform = &self.collab.platform;
        let process = self.workflow.launch.as_deref().map(|p| process_name(&p.to_string_lossy()));

        if let Some(window) = self.find_client() {
            info!(window, "closing client");
            if let Err(e) = platform.terminate_gracefully(window) {
                warn!(window, error = %e, "graceful close failed");
            }
            let closed = self
                .wait_for(secs(self.settings.flow.exit_timeout_secs), |s| s.find_client().is_none().then_some(()))
                .is_some();
            if closed {
                info!("client exited");
                return;
            }
        } else if !process.as_deref().map_or(false, |p| platform.is_running(p)) {
            return;
        }

        let kill = force || self.settings.flow.force_kill_on_exit_fail;
        match process {
            Some(name) if kill => {
                warn!(process = %name, "client did not exit, killing");
                if let Err(e) = platform.kill(&name) {
                    warn!(process = %name, error = %e, "kill failed");
                }
            }
            Some(name) => warn!(process = %name, "client still running, leaving it"),
            None => warn!("client still running and no launch path to kill by"),
        }
    }
}

impl AccountRunner for SessionRunner {
    fn run_account(&mut self, account: &AccountRecord) -> Result<(), EngineError> {
        let window = self.ensure_client(account)?;
        let mut machine =
            SceneMachine::new(&self.collab, &self.perception, &self.workflow, &self.settings, account, window);
        machine.run()?;
        self.exit_client(false);
        Ok(())
    }

    fn teardown(&mut self, account: &AccountRecord) {
        info!(account = %account.id, "tearing down session");
        self.exit_client(true);
    }
}
