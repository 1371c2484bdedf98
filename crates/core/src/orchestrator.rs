use std::sync::Arc;

use chrono::Local;
use tracing::{error, info, warn};

use crate::clock::{jittered, secs, Clock};
use crate::error::EngineError;
use crate::monitor::{AccountView, Monitor};
use crate::platform::{EvidenceSink, FailureReport};
use crate::settings::FlowSettings;
use crate::state::{fingerprint, CycleState, CycleStatus, CycleStore, StopSignal};
use crate::types::{AccountOutcome, AccountRecord};

/// Runs one account from a fresh session to a terminal outcome.
pub trait AccountRunner {
    fn run_account(&mut self, account: &AccountRecord) -> Result<(), EngineError>;

    /// Drop whatever a failed attempt left behind before the next one.
    fn teardown(&mut self, account: &AccountRecord);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub cycle_id: String,
    pub status: CycleStatus,
    pub next_index: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Ids of the accounts started in this run, in order.
    pub attempted: Vec<String>,
}

/// Iterates the enabled account pool, persisting progress after every unit
/// of work. The stop flag is honored only before an account starts and
/// after one ends.
pub struct Orchestrator {
    store: CycleStore,
    stop: StopSignal,
    flow: FlowSettings,
    clock: Arc<dyn Clock>,
    evidence: Arc<dyn EvidenceSink>,
    monitor: Monitor,
}

impl Orchestrator {
    pub fn new(
        store: CycleStore,
        stop: StopSignal,
        flow: FlowSettings,
        clock: Arc<dyn Clock>,
        evidence: Arc<dyn EvidenceSink>,
    ) -> Self {
        Self { store, stop, flow, clock, evidence, monitor: Monitor::new() }
    }

    pub fn with_monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn store(&self) -> &CycleStore {
        &self.store
    }

    pub fn run_cycle(
        &self,
        accounts: &mut [AccountRecord],
        runner: &mut dyn AccountRunner,
    ) -> Result<CycleSummary, EngineError> {
        let pool: Vec<usize> = (0..accounts.len()).filter(|&i| accounts[i].enabled).collect();
        if pool.is_empty() {
            return Err(EngineError::Config("no enabled accounts".into()));
        }
        let fp = fingerprint(accounts);
        let total = pool.len();
        let mut state = match self.store.load() {
            Some(prev) if prev.resumable(&fp) => {
                info!(cycle = %prev.cycle_id, next_index = prev.next_index, total, "resuming cycle");
                prev
            }
            Some(prev) => {
                let reason = if prev.accounts_fingerprint != fp { "account pool changed" } else { "previous cycle finished" };
                info!(previous = %prev.cycle_id, reason, "starting new cycle");
                CycleState::new(fp, total)
            }
            None => {
                info!(total, "starting new cycle");
                CycleState::new(fp, total)
            }
        };
        for idx in &pool {
            accounts[*idx].retries = 0;
        }
        self.publish_pool(&state, accounts, &pool);

        let mut summary = CycleSummary {
            cycle_id: state.cycle_id.clone(),
            status: CycleStatus::Running,
            next_index: state.next_index,
            succeeded: 0,
            failed: 0,
            attempted: Vec::new(),
        };

        let start = state.next_index;
        for (i, &idx) in pool.iter().enumerate().skip(start) {
            if self.stop.is_set() {
                info!(next_index = i, "stop requested, not starting next account");
                return self.finish(&mut state, CycleStatus::Stopped, i, summary);
            }
            self.persist(&mut state, CycleStatus::Running, i)?;

            let account = &mut accounts[idx];
            summary.attempted.push(account.id.clone());
            let outcome = self.run_account(account, runner)?;
            account.last_outcome = Some(outcome.clone());
            self.monitor.update(|v| {
                if let Some(a) = v.account_mut(&account.id) {
                    a.outcome = Some(outcome.clone());
                    a.retries = account.retries;
                    a.active = false;
                }
            });

            match outcome {
                AccountOutcome::Manual(reason) => {
                    error!(account = %account.id, reason = %reason, "operator needed, halting cycle");
                    return self.finish(&mut state, CycleStatus::Manual, i, summary);
                }
                AccountOutcome::Succeeded => summary.succeeded += 1,
                AccountOutcome::Failed(reason) => {
                    warn!(account = %account.id, reason = %reason, "account failed, moving on");
                    summary.failed += 1;
                }
            }

            self.persist(&mut state, CycleStatus::Running, i + 1)?;
            if i + 1 < total {
                if self.stop.is_set() {
                    info!(next_index = i + 1, "stop requested after account");
                    return self.finish(&mut state, CycleStatus::Stopped, i + 1, summary);
                }
                let wait = jittered(secs(self.flow.wait_next_account_secs), secs(self.flow.wait_next_account_jitter_secs));
                info!(secs = wait.as_secs(), "waiting before next account");
                self.clock.sleep(wait);
            }
        }

        info!(cycle = %state.cycle_id, succeeded = summary.succeeded, failed = summary.failed, "cycle completed");
        self.finish(&mut state, CycleStatus::Completed, total + 1, summary)
    }

    /// Attempt one account until it succeeds, needs an operator or runs out
    /// of retries. Fatal errors propagate.
    fn run_account(&self, account: &mut AccountRecord, runner: &mut dyn AccountRunner) -> Result<AccountOutcome, EngineError> {
        loop {
            info!(account = %account.id, attempt = account.retries + 1, "starting account");
            self.monitor.update(|v| {
                if let Some(a) = v.account_mut(&account.id) {
                    a.active = true;
                    a.retries = account.retries;
                }
            });

            let err = match runner.run_account(account) {
                Ok(()) => {
                    info!(account = %account.id, "account succeeded");
                    return Ok(AccountOutcome::Succeeded);
                }
                Err(e) => e,
            };
            if err.requires_operator() {
                return Ok(AccountOutcome::Manual(err.to_string()));
            }
            if err.is_fatal() {
                error!(account = %account.id, error = %err, "fatal error, aborting cycle");
                self.evidence.record_failure(&FailureReport {
                    tag: "fatal".into(),
                    stage: "orchestrator".into(),
                    reason: err.to_string(),
                    account: Some(account.id.clone()),
                    ..Default::default()
                });
                return Err(err);
            }

            account.retries += 1;
            warn!(account = %account.id, retries = account.retries, error = %err, "account attempt failed");
            runner.teardown(account);
            if account.retries > self.flow.account_max_retry {
                return Ok(AccountOutcome::Failed(err.to_string()));
            }
        }
    }

    fn persist(&self, state: &mut CycleState, status: CycleStatus, next_index: usize) -> Result<(), EngineError> {
        debug_assert!(next_index >= state.next_index, "next_index went backwards");
        state.status = status;
        state.next_index = next_index;
        state.last_updated = Local::now();
        self.store.save(state)?;
        self.monitor.update(|v| {
            v.status = Some(status);
            v.next_index = next_index;
        });
        Ok(())
    }

    fn finish(
        &self,
        state: &mut CycleState,
        status: CycleStatus,
        next_index: usize,
        mut summary: CycleSummary,
    ) -> Result<CycleSummary, EngineError> {
        self.persist(state, status, next_index)?;
        summary.status = status;
        summary.next_index = next_index;
        Ok(summary)
    }

    fn publish_pool(&self, state: &CycleState, accounts: &[AccountRecord], pool: &[usize]) {
        self.monitor.update(|v| {
            v.status = Some(state.status);
            v.cycle_id = state.cycle_id.clone();
            v.next_index = state.next_index;
            v.total = state.total;
            v.accounts = pool
                .iter()
                .map(|&i| AccountView {
                    id: accounts[i].id.clone(),
                    outcome: accounts[i].last_outcome.clone(),
                    retries: 0,
                    active: false,
                })
                .collect();
        });
    }
}
