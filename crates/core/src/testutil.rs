//! Fixtures shared by the unit tests: deterministic images, an in-memory
//! evidence sink and a small simulated client.

use std::sync::{Arc, Mutex};

use image::{imageops, GrayImage, Rgba, RgbaImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;

use crate::clock::{Clock, ManualClock};
use crate::platform::stub::{StubPlatform, StubScreen, CLOSE};
use crate::platform::{Collaborators, EvidenceSink, FailureReport};
use crate::scene::{SceneDescriptor, SceneKind, SceneRegistry, TemplateRule};
use crate::settings::{ExceptionConfig, Settings, StepConfig};
use crate::machine::{ExceptionHandler, StepAction};
use crate::types::*;

pub const BADGE_AT: Point = Point { x: 20, y: 20 };
pub const BADGE_ROI: Rect = Rect { l: 16, t: 16, w: 20, h: 20 };
pub const WINDOW: Rect = Rect { l: 40, t: 40, w: 160, h: 120 };
pub const START: Rect = Rect { l: 100, t: 80, w: 30, h: 20 };
pub const CLOSE_BTN: Rect = Rect { l: 60, t: 90, w: 40, h: 16 };
pub const OK_TEXT: Rect = Rect { l: 70, t: 80, w: 20, h: 10 };

/// Gray noise; R = G = B so grayscale conversion is exact.
pub fn noise(w: u32, h: u32, seed: u64) -> RgbaImage {
    let mut rng = StdRng::seed_from_u64(seed);
    RgbaImage::from_fn(w, h, |_, _| {
        let v: u8 = rng.gen();
        Rgba([v, v, v, 255])
    })
}

pub fn paste(canvas: &mut RgbaImage, patch: &RgbaImage, at: Point) {
    imageops::replace(canvas, patch, at.x as i64, at.y as i64);
}

pub fn gray(img: &RgbaImage) -> GrayImage {
    imageops::grayscale(img)
}

pub fn screen_with_badge(seed: u64, badge: &RgbaImage) -> RgbaImage {
    let mut img = noise(WINDOW.w as u32, WINDOW.h as u32, seed);
    paste(&mut img, badge, BADGE_AT);
    img
}

#[derive(Default)]
pub struct MemoryEvidence {
    pub reports: Mutex<Vec<FailureReport>>,
}

impl MemoryEvidence {
    pub fn count(&self) -> usize {
        self.reports.lock().unwrap().len()
    }
}

impl EvidenceSink for MemoryEvidence {
    fn record_failure(&self, report: &FailureReport) {
        self.reports.lock().unwrap().push(report.clone());
    }
}

pub struct Harness {
    pub stub: Arc<StubPlatform>,
    pub clock: Arc<ManualClock>,
    pub evidence: Arc<MemoryEvidence>,
    pub collab: Collaborators,
}

pub fn harness() -> Harness {
    let stub = Arc::new(StubPlatform::new(Rect::new(0, 0, 800, 560)));
    let clock = Arc::new(ManualClock::new());
    let evidence = Arc::new(MemoryEvidence::default());
    let collab = Collaborators::from_stub(stub.clone(), evidence.clone(), clock.clone() as Arc<dyn Clock>);
    Harness { stub, clock, evidence, collab }
}

fn badge(seed: u64) -> RgbaImage {
    noise(12, 12, seed)
}

fn badge_rule(seed: u64) -> TemplateRule {
    TemplateRule::new("badge", gray(&badge(seed)), 0.86).within(BADGE_ROI)
}

/// Scenes of the simulated client: login -> lobby -> play, with a
/// dismissable "notice" popup.
pub fn client_registry() -> SceneRegistry {
    SceneRegistry::new(vec![
        SceneDescriptor::new("login", SceneKind::Primary).with_detect(badge_rule(101)),
        SceneDescriptor::new("lobby", SceneKind::Primary)
            .with_detect(badge_rule(102))
            .with_region("start", START),
        SceneDescriptor::new("play", SceneKind::Primary).with_detect(badge_rule(103)),
        SceneDescriptor::new("notice", SceneKind::Exceptional)
            .with_detect(badge_rule(109))
            .with_region("close", CLOSE_BTN)
            .with_text(Regex::new("(?i)server notice").unwrap(), 0.5),
    ])
    .unwrap()
}

/// Screens matching `client_registry`. `login` leads to `after_login`.
pub fn install_client(stub: &StubPlatform, after_login: &str) {
    stub.add_screen(StubScreen::new("login", screen_with_badge(1, &badge(101))).on_login(after_login));
    stub.add_screen(StubScreen::new("lobby", screen_with_badge(2, &badge(102))).hotspot(START, "play"));
    stub.add_screen(StubScreen::new("play", screen_with_badge(3, &badge(103))).key("alt+f4", CLOSE));
    stub.add_screen(StubScreen::new("notice", screen_with_badge(9, &badge(109))).hotspot(CLOSE_BTN, "lobby"));
    // only reachable through text recognition
    stub.add_screen(
        StubScreen::new("popup", noise(WINDOW.w as u32, WINDOW.h as u32, 10))
            .text("Server notice", 0.9, Rect::new(50, 40, 60, 12))
            .text("OK", 0.9, OK_TEXT)
            .hotspot(OK_TEXT, "lobby"),
    );
    stub.add_screen(StubScreen::new("blank", noise(WINDOW.w as u32, WINDOW.h as u32, 11)));
    stub.add_launcher("client.exe", "Client", WINDOW, "login");
}

/// Settings for the simulated client with short, test-friendly timings.
pub fn client_settings() -> Settings {
    let mut s = Settings::default();
    s.flow.scene_timeout_secs = 5;
    s.flow.poll_interval_ms = 500;
    s.flow.exception_delay_secs = 1;
    s.flow.step_retry = 1;
    s.flow.transition_timeout_secs = 3;
    s.flow.launch_wait_secs = 3;
    s.flow.exit_timeout_secs = 2;
    s.flow.wait_next_account_secs = 1;
    s.workflow.window_title = "Client".into();
    s.workflow.launch = Some("C:/Games/client.exe".into());
    s.workflow.steps = vec![
        StepConfig { scene: "login".into(), action: StepAction::Authenticate, verify_next: true },
        StepConfig { scene: "lobby".into(), action: StepAction::Click { region: "start".into() }, verify_next: true },
        StepConfig {
            scene: "play".into(),
            action: StepAction::Idle { seconds: 2, jitter_seconds: 0 },
            verify_next: false,
        },
    ];
    s.workflow.exceptions = vec![ExceptionConfig {
        scene: "notice".into(),
        handler: ExceptionHandler::Dismiss { region: "close".into() },
    }];
    s
}
