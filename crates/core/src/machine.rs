use std::path::PathBuf;
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::action::{Actor, ClickAttemptResult, ClickResult, ClickTarget};
use crate::clock::{jittered, millis, secs};
use crate::error::{BackendError, EngineError};
use crate::failure::FailureHandler;
use crate::perception::Perception;
use crate::platform::{Collaborators, LoginOutcome};
use crate::scene::{SceneDescriptor, SceneRegistry};
use crate::settings::{ErrorPolicy, Settings, WorkflowConfig};
use crate::types::*;

/// What to do once a step's scene is showing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    Click { region: String },
    Keys { sequence: String },
    /// Paste through the clipboard; the previous content is restored.
    Paste { text: String },
    Authenticate,
    /// Pick one of the visible `targets` at random, refreshing the list when
    /// none is visible.
    Select {
        targets: Vec<String>,
        #[serde(default)]
        confirm: Option<String>,
        #[serde(default)]
        refresh: Option<String>,
        #[serde(default)]
        end_session: Option<String>,
    },
    Idle {
        seconds: u64,
        #[serde(default)]
        jitter_seconds: u64,
    },
    #[default]
    None,
}

/// Reaction to a detected exceptional scene.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExceptionHandler {
    Dismiss { region: String },
    Keys { sequence: String },
    /// Click the first recognized clickable keyword.
    #[default]
    ClickKeyword,
    /// Wait one poll interval and look for the expected scene again.
    Retry,
    /// Give up on this session; the account is retried from the top.
    Restart,
    Manual,
}

#[derive(Debug, Clone)]
pub struct Step {
    pub scene: Arc<SceneDescriptor>,
    pub action: StepAction,
    pub verify_next: bool,
}

#[derive(Debug, Clone)]
pub struct ExceptionRule {
    pub scene: Arc<SceneDescriptor>,
    pub handler: ExceptionHandler,
}

/// A workflow with every scene name resolved against the registry.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub window_title: String,
    pub launch: Option<PathBuf>,
    pub steps: Vec<Step>,
    pub exceptions: Vec<ExceptionRule>,
}

impl Workflow {
    pub fn resolve(cfg: &WorkflowConfig, registry: &SceneRegistry) -> Result<Self, EngineError> {
        if cfg.window_title.trim().is_empty() {
            return Err(EngineError::Config("workflow.window_title is empty".into()));
        }
        if cfg.steps.is_empty() {
            return Err(EngineError::Config("workflow has no steps".into()));
        }
        let lookup = |name: &str| {
            registry.get(name).ok_or_else(|| EngineError::Config(format!("unknown scene '{}'", name)))
        };

        let mut steps = Vec::with_capacity(cfg.steps.len());
        for s in &cfg.steps {
            let scene = lookup(&s.scene)?;
            if scene.is_exceptional() {
                return Err(EngineError::Config(format!("step scene '{}' is exceptional", s.scene)));
            }
            steps.push(Step { scene, action: s.action.clone(), verify_next: s.verify_next });
        }
        let mut exceptions = Vec::with_capacity(cfg.exceptions.len());
        for e in &cfg.exceptions {
            let scene = lookup(&e.scene)?;
            if !scene.is_exceptional() {
                return Err(EngineError::Config(format!("exception scene '{}' is not exceptional", e.scene)));
            }
            exceptions.push(ExceptionRule { scene, handler: e.handler.clone() });
        }
        Ok(Self { window_title: cfg.window_title.clone(), launch: cfg.launch.clone(), steps, exceptions })
    }

    /// The curated set considered when the expected scene is late.
    pub fn exceptional_scenes(&self) -> Vec<Arc<SceneDescriptor>> {
        self.exceptions.iter().map(|e| e.scene.clone()).collect()
    }

    fn exception(&self, name: &str) -> Option<&ExceptionRule> {
        self.exceptions.iter().find(|e| e.scene.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineState {
    AwaitScene(usize),
    ActOnScene(usize),
    VerifyTransition(usize),
    ExceptionScan { step: usize, scene: String },
    Success,
    /// `outcome` overrides the configured error policy.
    Failed { stage: String, reason: String, outcome: Option<ErrorPolicy> },
}

impl MachineState {
    /// Workflow step this state works on; `None` once terminal.
    pub fn step(&self) -> Option<usize> {
        match self {
            MachineState::AwaitScene(i) | MachineState::ActOnScene(i) | MachineState::VerifyTransition(i) => Some(*i),
            MachineState::ExceptionScan { step, .. } => Some(*step),
            MachineState::Success | MachineState::Failed { .. } => None,
        }
    }
}

enum Wait {
    Found,
    SkipTo(usize),
    Exception(String),
    NotFound,
}

enum ActOutcome {
    Done,
    Retry(EngineError),
    Escalate(String),
}

/// Drives one account through the workflow's scenes.
pub struct SceneMachine<'a> {
    collab: &'a Collaborators,
    perception: &'a Perception,
    workflow: &'a Workflow,
    settings: &'a Settings,
    account: &'a AccountRecord,
    window: WindowId,
    attempts: Vec<u32>,
    exceptions: u32,
    last_attempts: Vec<ClickAttemptResult>,
    trace: Vec<MachineState>,
}

impl<'a> SceneMachine<'a> {
    pub fn new(
        collab: &'a Collaborators,
        perception: &'a Perception,
        workflow: &'a Workflow,
        settings: &'a Settings,
        account: &'a AccountRecord,
        window: WindowId,
    ) -> Self {
        Self {
            collab,
            perception,
            workflow,
            settings,
            account,
            window,
            attempts: vec![0; workflow.steps.len()],
            exceptions: 0,
            last_attempts: Vec::new(),
            trace: Vec::new(),
        }
    }

    /// Every state visited, in order.
    pub fn trace(&self) -> &[MachineState] {
        &self.trace
    }

    /// Run until `Success` or `Failed`. Failures leave through the shared
    /// failure handler as either a recoverable or a manual-intervention error.
    pub fn run(&mut self) -> Result<(), EngineError> {
        let mut state = MachineState::AwaitScene(0);
        let mut current = None;
        for _ in 0..self.transition_budget() {
            debug!(account = %self.account.id, state = ?state, "machine");
            self.trace.push(state.clone());
            if state.step() != current {
                // evidence only carries the click log of the failing step
                current = state.step();
                self.last_attempts.clear();
            }
            state = match state {
                MachineState::Success => {
                    info!(account = %self.account.id, "workflow complete");
                    return Ok(());
                }
                MachineState::Failed { stage, reason, outcome } => {
                    return Err(self.escalate(&stage, &reason, outcome));
                }
                other => {
                    let step = other.step().unwrap_or_default();
                    match self.advance(other) {
                        Ok(next) => next,
                        Err(e) => self.absorb(step, e)?,
                    }
                }
            };
        }
        Err(self.escalate("machine", "transition_budget_exhausted", None))
    }

    fn advance(&mut self, state: MachineState) -> Result<MachineState, EngineError> {
        let steps = self.workflow.steps.len();
        Ok(match state {
            MachineState::AwaitScene(i) => match self.wait_scene(i)? {
                Wait::Found => MachineState::ActOnScene(i),
                Wait::SkipTo(j) => {
                    info!(from = %self.workflow.steps[i].scene.name, to = %self.workflow.steps[j].scene.name, "skipping ahead");
                    MachineState::ActOnScene(j)
                }
                Wait::Exception(scene) => MachineState::ExceptionScan { step: i, scene },
                Wait::NotFound => {
                    let scene = self.workflow.steps[i].scene.name.clone();
                    self.retry_or_fail(i, EngineError::NotFound { scene })
                }
            },
            MachineState::ActOnScene(i) => match self.act(i)? {
                ActOutcome::Done if i + 1 == steps => MachineState::Success,
                ActOutcome::Done if self.workflow.steps[i].verify_next => MachineState::VerifyTransition(i),
                ActOutcome::Done => MachineState::AwaitScene(i + 1),
                ActOutcome::Retry(cause) => self.retry_or_fail(i, cause),
                ActOutcome::Escalate(reason) => self.failed(i, reason, None),
            },
            MachineState::VerifyTransition(i) => self.verify_transition(i)?,
            MachineState::ExceptionScan { step, scene } => self.handle_exception(step, &scene)?,
            terminal => terminal,
        })
    }

    /// A backend call failed mid-step. Anything short of a dead backend
    /// counts as a failed attempt of that step, so it reaches the failure
    /// handler with the rest.
    fn absorb(&mut self, i: usize, e: EngineError) -> Result<MachineState, EngineError> {
        match e {
            e @ EngineError::Backend(_) if !e.is_fatal() => {
                let stage = self.workflow.steps[i].scene.name.clone();
                let cause = EngineError::ActionFailed { stage, reason: format!("backend_error: {}", e) };
                Ok(self.retry_or_fail(i, cause))
            }
            e => Err(e),
        }
    }

    fn transition_budget(&self) -> usize {
        let flow = &self.settings.flow;
        let steps = self.workflow.steps.len();
        steps * 3 * (flow.step_retry as usize + 2) + 2 * (flow.exception_limit as usize + 1) + 4
    }

    fn failed(&self, i: usize, reason: String, outcome: Option<ErrorPolicy>) -> MachineState {
        MachineState::Failed { stage: self.workflow.steps[i].scene.name.clone(), reason, outcome }
    }

    fn retry_or_fail(&mut self, i: usize, cause: EngineError) -> MachineState {
        self.attempts[i] += 1;
        warn!(step = i, attempt = self.attempts[i], error = %cause, "step failed");
        if self.attempts[i] > self.settings.flow.step_retry {
            self.failed(i, cause.to_string(), None)
        } else {
            MachineState::AwaitScene(i)
        }
    }

    fn escalate(&self, stage: &str, reason: &str, outcome: Option<ErrorPolicy>) -> EngineError {
        let policy = self.settings.flow.error_policy;
        FailureHandler::new(self.collab, policy, &self.account.id).escalate_as(
            outcome.unwrap_or(policy),
            Some(self.window),
            stage,
            reason,
            &self.last_attempts,
        )
    }

    fn actor(&self) -> Actor<'a> {
        let collab: &'a Collaborators = self.collab;
        let settings: &'a Settings = self.settings;
        let perception: &'a Perception = self.perception;
        Actor::new(collab.platform.as_ref(), collab.clock.as_ref(), &settings.click, &settings.recover).with_fallback(perception)
    }

    fn poll(&self) {
        self.collab.clock.sleep(millis(self.settings.flow.poll_interval_ms));
    }

    /// Capture the client window, following it if it was recreated.
    /// `None` when it is missing right now.
    fn capture(&mut self) -> Result<Option<Capture>, EngineError> {
        let Some(window) = self.collab.platform.find_window(&self.workflow.window_title) else {
            return Ok(None);
        };
        self.window = window;
        match self.perception.capture(window) {
            Ok(c) => Ok(Some(c)),
            Err(BackendError::WindowGone(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn wait_scene(&mut self, i: usize) -> Result<Wait, EngineError> {
        let flow = &self.settings.flow;
        let clock = &self.collab.clock;
        let workflow: &'a Workflow = self.workflow;
        let expected = vec![workflow.steps[i].scene.clone()];
        let exceptional = workflow.exceptional_scenes();
        let mut wide: Vec<Arc<SceneDescriptor>> = workflow.steps[i + 1..]
            .iter()
            .map(|s| s.scene.clone())
            .filter(|s| s.name != expected[0].name)
            .collect();
        wide.extend(exceptional.iter().cloned());

        let timeout = secs(flow.scene_timeout_secs);
        let delay = secs(flow.exception_delay_secs);
        let scan_every = secs(flow.exception_scan_interval_secs);
        let ocr_every = secs(flow.ocr_interval_secs);
        let started = clock.now();
        let (mut last_scan, mut last_ocr) = (None, None);

        loop {
            let now = clock.now();
            let elapsed = now.saturating_sub(started);
            if elapsed >= timeout {
                info!(scene = %expected[0].name, waited = ?elapsed, "scene not found");
                return Ok(Wait::NotFound);
            }
            let Some(cap) = self.capture()? else {
                self.poll();
                continue;
            };

            if self.perception.classify(&cap, &expected, false)?.matched {
                return Ok(Wait::Found);
            }

            if elapsed >= delay {
                if last_scan.map_or(true, |t| now.saturating_sub(t) >= scan_every) {
                    last_scan = Some(now);
                    let r = self.perception.classify(&cap, &wide, false)?;
                    if let Some(scene) = r.scene {
                        if scene.is_exceptional() {
                            return Ok(Wait::Exception(scene.name.clone()));
                        }
                        if let Some(j) = workflow.steps.iter().skip(i + 1).position(|s| s.scene.name == scene.name) {
                            return Ok(Wait::SkipTo(i + 1 + j));
                        }
                    }
                }
                if !exceptional.is_empty() && last_ocr.map_or(true, |t| now.saturating_sub(t) >= ocr_every) {
                    last_ocr = Some(now);
                    let r = self.perception.classify(&cap, &exceptional, true)?;
                    if let Some(scene) = r.scene {
                        info!(scene = %scene.name, method = ?r.method, confidence = r.confidence, "exceptional scene");
                        return Ok(Wait::Exception(scene.name.clone()));
                    }
                }
            }
            self.poll();
        }
    }

    fn verify_transition(&mut self, i: usize) -> Result<MachineState, EngineError> {
        let current = self.workflow.steps[i].scene.clone();
        let next = self.workflow.steps[i + 1].scene.clone();
        let pair = vec![current.clone(), next.clone()];
        let timeout = secs(self.settings.flow.transition_timeout_secs);
        let started = self.collab.clock.now();
        let mut still_current = false;

        while self.collab.clock.now().saturating_sub(started) < timeout {
            if let Some(cap) = self.capture()? {
                let r = self.perception.classify(&cap, &pair, false)?;
                match r.scene_name() {
                    Some(name) if name == next.name => return Ok(MachineState::AwaitScene(i + 1)),
                    Some(name) => still_current = name == current.name,
                    None => still_current = false,
                }
            }
            self.poll();
        }

        if still_current {
            let cause = EngineError::ActionFailed {
                stage: current.name.clone(),
                reason: "transition_not_observed".into(),
            };
            return Ok(self.retry_or_fail(i, cause));
        }
        // something else is showing; the next wait decides
        Ok(MachineState::AwaitScene(i + 1))
    }

    fn act(&mut self, i: usize) -> Result<ActOutcome, EngineError> {
        let workflow: &'a Workflow = self.workflow;
        let step = &workflow.steps[i];
        info!(account = %self.account.id, scene = %step.scene.name, action = ?step.action, "acting");
        let action_failed = |reason: &str| {
            ActOutcome::Retry(EngineError::ActionFailed { stage: step.scene.name.clone(), reason: reason.to_string() })
        };

        match &step.action {
            StepAction::Click { region } => {
                let Some(cap) = self.capture()? else { return Ok(action_failed("window_missing")) };
                let Some(rect) = self.perception.locate(&cap, &step.scene, region) else {
                    return Ok(action_failed(&format!("region_not_located: {}", region)));
                };
                let r = self.click_in(&step.scene, rect, region, step.verify_next)?;
                Ok(if r.success { ActOutcome::Done } else { action_failed(&r.final_reason) })
            }
            StepAction::Keys { sequence } => {
                if self.actor().perform_key_sequence(self.window, &workflow.window_title, sequence)? {
                    Ok(ActOutcome::Done)
                } else {
                    Ok(action_failed("keys_not_sent"))
                }
            }
            StepAction::Paste { text } => {
                if self.actor().paste_text(self.window, &workflow.window_title, text)? {
                    Ok(ActOutcome::Done)
                } else {
                    Ok(action_failed("paste_not_sent"))
                }
            }
            StepAction::Authenticate => match self.collab.auth.perform_login(&self.account.credentials) {
                LoginOutcome::Success => Ok(ActOutcome::Done),
                LoginOutcome::Failure(reason) => Ok(action_failed(&format!("login_failed: {}", reason))),
            },
            StepAction::Select { targets, confirm, refresh, end_session } => {
                self.select(&step.scene, targets, confirm.as_deref(), refresh.as_deref(), end_session.as_deref())
            }
            StepAction::Idle { seconds, jitter_seconds } => {
                let d = jittered(secs(*seconds), secs(*jitter_seconds));
                info!(secs = d.as_secs(), "idling");
                self.collab.clock.sleep(d);
                Ok(ActOutcome::Done)
            }
            StepAction::None => Ok(ActOutcome::Done),
        }
    }

    /// Click a window-relative rect. With `verify_gone` the click only
    /// counts once `scene` stops matching.
    fn click_in(&mut self, scene: &Arc<SceneDescriptor>, region: Rect, label: &str, verify_gone: bool) -> Result<ClickResult, EngineError> {
        let workflow: &'a Workflow = self.workflow;
        let perception: &'a Perception = self.perception;
        let window = self.window;
        let target = ClickTarget { window, title: &workflow.window_title, region, label };
        let actor = self.actor();

        let result = if verify_gone {
            let only = std::slice::from_ref(scene);
            let mut gone = |_p: Point| -> Result<bool, EngineError> {
                match perception.capture(window) {
                    Ok(cap) => Ok(!perception.classify(&cap, only, false)?.matched),
                    Err(BackendError::WindowGone(_)) => Ok(true),
                    Err(e) => Err(e.into()),
                }
            };
            actor.perform_click(&target, Some(&mut gone))?
        } else {
            actor.perform_click(&target, None)?
        };
        self.last_attempts = result.attempts.clone();
        Ok(result)
    }

    fn locate_now(&mut self, scene: &SceneDescriptor, name: &str) -> Result<Option<Rect>, EngineError> {
        Ok(self.capture()?.and_then(|cap| self.perception.locate(&cap, scene, name)))
    }

    /// Poll for any visible selectable target until the search timeout.
    fn search_targets(&mut self, scene: &SceneDescriptor, targets: &[String]) -> Result<Vec<(String, Rect)>, EngineError> {
        let timeout = secs(self.settings.flow.select_search_timeout_secs);
        let started = self.collab.clock.now();
        loop {
            if let Some(cap) = self.capture()? {
                let found: Vec<(String, Rect)> = targets
                    .iter()
                    .filter_map(|t| self.perception.locate(&cap, scene, t).map(|r| (t.clone(), r)))
                    .collect();
                if !found.is_empty() {
                    return Ok(found);
                }
            }
            if self.collab.clock.now().saturating_sub(started) >= timeout {
                return Ok(Vec::new());
            }
            self.poll();
        }
    }

    fn select(
        &mut self,
        scene: &Arc<SceneDescriptor>,
        targets: &[String],
        confirm: Option<&str>,
        refresh: Option<&str>,
        end_session: Option<&str>,
    ) -> Result<ActOutcome, EngineError> {
        let flow = &self.settings.flow;
        let (refresh_max, refresh_delay) = (flow.select_refresh_max, millis(flow.select_refresh_delay_ms));
        let mut refreshes = 0u32;

        let found = loop {
            let found = self.search_targets(scene, targets)?;
            if !found.is_empty() {
                break found;
            }
            match refresh {
                Some(name) if refreshes < refresh_max => {
                    refreshes += 1;
                    info!(scene = %scene.name, refreshes, "no selectable target, refreshing");
                    if let Some(rect) = self.locate_now(scene, name)? {
                        self.click_in(scene, rect, name, false)?;
                    }
                    self.collab.clock.sleep(refresh_delay);
                }
                _ => {
                    warn!(scene = %scene.name, refreshes, "selection exhausted, ending session");
                    if let Some(name) = end_session {
                        if let Some(rect) = self.locate_now(scene, name)? {
                            self.click_in(scene, rect, name, false)?;
                        }
                    }
                    return Ok(ActOutcome::Escalate(format!("select_refresh_exhausted after {} refreshes", refreshes)));
                }
            }
        };

        let Some((name, rect)) = found.choose(&mut rand::thread_rng()).cloned() else {
            return Ok(ActOutcome::Escalate("select_no_target".into()));
        };
        info!(scene = %scene.name, target = %name, "selected");
        let picked = self.click_in(scene, rect, &name, false)?;
        if !picked.success {
            return Ok(ActOutcome::Retry(EngineError::ActionFailed { stage: scene.name.clone(), reason: picked.final_reason }));
        }
        let Some(confirm) = confirm else { return Ok(ActOutcome::Done) };
        let Some(rect) = self.locate_now(scene, confirm)? else {
            return Ok(ActOutcome::Retry(EngineError::ActionFailed {
                stage: scene.name.clone(),
                reason: format!("region_not_located: {}", confirm),
            }));
        };
        let confirmed = self.click_in(scene, rect, confirm, true)?;
        Ok(if confirmed.success {
            ActOutcome::Done
        } else {
            ActOutcome::Retry(EngineError::ActionFailed { stage: scene.name.clone(), reason: confirmed.final_reason })
        })
    }

    fn handle_exception(&mut self, step: usize, scene_name: &str) -> Result<MachineState, EngineError> {
        self.exceptions += 1;
        if self.exceptions > self.settings.flow.exception_limit {
            let cause = EngineError::ExceptionalScene { scene: scene_name.to_string() };
            return Ok(self.failed(step, format!("exception_limit_exceeded: {}", cause), None));
        }
        let workflow: &'a Workflow = self.workflow;
        let Some(rule) = workflow.exception(scene_name) else {
            warn!(scene = scene_name, "no handler for exceptional scene");
            self.poll();
            return Ok(MachineState::AwaitScene(step));
        };
        info!(scene = scene_name, handler = ?rule.handler, count = self.exceptions, "handling exceptional scene");

        match &rule.handler {
            ExceptionHandler::Dismiss { region } => match self.locate_now(&rule.scene, region)? {
                Some(rect) => {
                    let r = self.click_in(&rule.scene, rect, region, true)?;
                    if !r.success {
                        warn!(scene = scene_name, reason = %r.final_reason, "dismiss click failed");
                    }
                }
                None => warn!(scene = scene_name, region = %region, "dismiss region not located"),
            },
            ExceptionHandler::Keys { sequence } => {
                self.actor().perform_key_sequence(self.window, &workflow.window_title, sequence)?;
            }
            ExceptionHandler::ClickKeyword => {
                let hits = self.perception.find_keywords(self.window, &self.settings.flow.clickable_keywords)?;
                match hits.first() {
                    Some(hit) => {
                        self.click_in(&rule.scene, hit.location, &hit.text, false)?;
                    }
                    None => warn!(scene = scene_name, "no clickable keyword recognized"),
                }
            }
            ExceptionHandler::Retry => self.poll(),
            ExceptionHandler::Restart => {
                return Ok(self.failed(step, format!("{} requested restart", scene_name), Some(ErrorPolicy::Restart)));
            }
            ExceptionHandler::Manual => {
                return Ok(self.failed(step, format!("{} requires an operator", scene_name), Some(ErrorPolicy::Manual)));
            }
        }
        Ok(MachineState::AwaitScene(step))
    }
}
