use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::machine::{ExceptionHandler, StepAction};
use crate::types::AccountRecord;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub accounts: Vec<AccountConfig>,
    pub flow: FlowSettings,
    pub click: ClickSettings,
    pub recover: RecoverSettings,
    pub schedule: ScheduleSettings,
    pub workflow: WorkflowConfig,
    pub paths: Paths,
}

impl Settings {
    /// Missing file means defaults; a file that does not parse is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))
    }

    pub fn account_records(&self) -> Vec<AccountRecord> {
        self.accounts
            .iter()
            .map(|a| {
                let id = if a.id.is_empty() { a.username.clone() } else { a.id.clone() };
                let mut rec = AccountRecord::new(id, &a.username, &a.password);
                rec.enabled = a.enabled;
                rec
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    #[serde(default)]
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "yes")]
    pub enabled: bool,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Tear the session down and retry the account.
    #[default]
    Restart,
    /// Halt the cycle for an operator.
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowSettings {
    pub scene_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// How long the expected scene may be missing before exceptional
    /// scenes are considered.
    pub exception_delay_secs: u64,
    pub exception_scan_interval_secs: u64,
    pub ocr_interval_secs: u64,
    pub ocr_region_ratio: f32,
    pub ocr_min_confidence: f32,
    pub clickable_keywords: Vec<String>,
    pub step_retry: u32,
    pub exception_limit: u32,
    pub select_search_timeout_secs: u64,
    pub select_refresh_max: u32,
    pub select_refresh_delay_ms: u64,
    pub transition_timeout_secs: u64,
    pub error_policy: ErrorPolicy,
    pub account_max_retry: u32,
    pub wait_next_account_secs: u64,
    pub wait_next_account_jitter_secs: u64,
    pub exit_timeout_secs: u64,
    pub force_kill_on_exit_fail: bool,
    pub launch_retry: u32,
    pub launch_wait_secs: u64,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            scene_timeout_secs: 120,
            poll_interval_ms: 500,
            exception_delay_secs: 10,
            exception_scan_interval_secs: 2,
            ocr_interval_secs: 10,
            ocr_region_ratio: 0.6,
            ocr_min_confidence: 0.5,
            clickable_keywords: ["OK", "Confirm", "Close", "Yes", "Retry", "确定", "确认", "关闭"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            step_retry: 2,
            exception_limit: 3,
            select_search_timeout_secs: 5,
            select_refresh_max: 3,
            select_refresh_delay_ms: 5000,
            transition_timeout_secs: 10,
            error_policy: ErrorPolicy::Restart,
            account_max_retry: 2,
            wait_next_account_secs: 10,
            wait_next_account_jitter_secs: 0,
            exit_timeout_secs: 30,
            force_kill_on_exit_fail: true,
            launch_retry: 3,
            launch_wait_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickSettings {
    pub max_rounds: u32,
    /// Pixel offsets from the region center, tried in order.
    pub candidate_offsets: Vec<(i32, i32)>,
    /// Sleep after round N is `backoff_ms[min(N-1, len-1)]`.
    pub backoff_ms: Vec<u64>,
    pub guard_padding: i32,
    pub post_click_delay_ms: u64,
    pub foreground_wait_ms: u64,
    pub verify_foreground: bool,
    /// After the last round, click a recognized clickable keyword instead.
    pub ocr_fallback: bool,
}

impl Default for ClickSettings {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            candidate_offsets: vec![(0, 0), (0, -3), (0, 3), (-3, 0), (3, 0)],
            backoff_ms: vec![100, 250, 500],
            guard_padding: 4,
            post_click_delay_ms: 150,
            foreground_wait_ms: 100,
            verify_foreground: true,
            ocr_fallback: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverSettings {
    pub enabled: bool,
    pub max_attempts: u32,
    pub cooldown_ms: u64,
    /// Distance kept from the work-area edges when repositioning.
    pub padding: i32,
}

impl Default for RecoverSettings {
    fn default() -> Self {
        Self { enabled: true, max_attempts: 2, cooldown_ms: 500, padding: 8 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    #[default]
    FixedTimes,
    RandomWindow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    pub enabled: bool,
    pub mode: ScheduleMode,
    /// `"HH:MM"` local times.
    pub fixed_times: Vec<String>,
    pub windows: Vec<TimeWindow>,
    pub runs_per_window: u32,
    pub min_gap_minutes: u32,
    pub jitter_minutes: u32,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: ScheduleMode::FixedTimes,
            fixed_times: vec!["09:00".into()],
            windows: Vec::new(),
            runs_per_window: 1,
            min_gap_minutes: 90,
            jitter_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub scene: String,
    #[serde(default)]
    pub action: StepAction,
    /// Confirm the scene actually changes after acting on it.
    #[serde(default = "yes")]
    pub verify_next: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionConfig {
    pub scene: String,
    #[serde(default)]
    pub handler: ExceptionHandler,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Substring of the client window title.
    pub window_title: String,
    pub launch: Option<PathBuf>,
    pub steps: Vec<StepConfig>,
    pub exceptions: Vec<ExceptionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Paths {
    pub anchors: PathBuf,
    pub state: PathBuf,
    pub stop_flag: PathBuf,
    pub lock: PathBuf,
    pub evidence: PathBuf,
    pub logs: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            anchors: "anchors".into(),
            state: "data/state.json".into(),
            stop_flag: "data/stop.flag".into(),
            lock: "data/rota.lock".into(),
            evidence: "evidence".into(),
            logs: "logs".into(),
        }
    }
}

impl Paths {
    /// Relative entries resolved against `base`.
    pub fn resolve(&self, base: &Path) -> Paths {
        let r = |p: &PathBuf| if p.is_absolute() { p.clone() } else { base.join(p) };
        Paths {
            anchors: r(&self.anchors),
            state: r(&self.state),
            stop_flag: r(&self.stop_flag),
            lock: r(&self.lock),
            evidence: r(&self.evidence),
            logs: r(&self.logs),
        }
    }
}
