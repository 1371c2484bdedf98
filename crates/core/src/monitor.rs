use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};

use crate::state::CycleStatus;
use crate::types::AccountOutcome;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountView {
    pub id: String,
    pub outcome: Option<AccountOutcome>,
    pub retries: u32,
    pub active: bool,
}

/// What an operator sees: the current cycle and every account in it.
#[derive(Debug, Clone, Default)]
pub struct MonitorView {
    pub status: Option<CycleStatus>,
    pub cycle_id: String,
    pub next_index: usize,
    pub total: usize,
    pub accounts: Vec<AccountView>,
    pub last_trigger: Option<(DateTime<Local>, String)>,
}

impl MonitorView {
    pub fn account_mut(&mut self, id: &str) -> Option<&mut AccountView> {
        self.accounts.iter_mut().find(|a| a.id == id)
    }
}

/// Shared handle; the engine writes, the TUI reads snapshots.
#[derive(Debug, Clone, Default)]
pub struct Monitor(Arc<Mutex<MonitorView>>);

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, f: impl FnOnce(&mut MonitorView)) {
        f(&mut self.0.lock().unwrap())
    }

    pub fn snapshot(&self) -> MonitorView {
        self.0.lock().unwrap().clone()
    }
}
