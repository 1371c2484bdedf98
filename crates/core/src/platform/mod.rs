pub mod stub;

use std::path::Path;
use std::sync::Arc;

use image::RgbaImage;
use serde::Serialize;
use tracing::warn;

use crate::action::ClickAttemptResult;
use crate::clock::Clock;
use crate::error::BackendError;
use crate::types::*;

pub trait ScreenCapture: Send + Sync {
    /// Capture `rect` (window-relative) of a window, or its whole client
    /// area when `rect` is `None`.
    fn capture_region(&self, window: WindowId, rect: Option<Rect>) -> Result<Capture, BackendError>;
}

pub trait InputDevice: Send + Sync {
    /// Left click at a screen point.
    fn click(&self, at: Point) -> Result<(), BackendError>;
    /// Key chord or sequence such as `"enter"` or `"ctrl+v"`.
    fn send_keys(&self, sequence: &str) -> Result<(), BackendError>;
    fn set_clipboard_text(&self, text: &str) -> Result<(), BackendError>;
    fn clipboard_text(&self) -> Result<Option<String>, BackendError>;
    fn clear_clipboard(&self) -> Result<(), BackendError>;
}

pub trait WindowManager: Send + Sync {
    /// Most recently activated window whose title contains `keyword`.
    fn find_window(&self, keyword: &str) -> Option<WindowId>;
    fn foreground_window(&self) -> Option<WindowId>;
    fn window_title(&self, window: WindowId) -> Option<String>;
    fn bring_to_foreground(&self, window: WindowId) -> Result<(), BackendError>;
    fn window_rect(&self, window: WindowId) -> Result<Rect, BackendError>;
    /// Move only. Implementations must never resize.
    fn move_window(&self, window: WindowId, to: Point) -> Result<(), BackendError>;
    /// Desktop area not covered by taskbars and docks.
    fn visible_work_area(&self) -> Result<Rect, BackendError>;
}

pub trait ProcessManager: Send + Sync {
    fn start_process(&self, path: &Path) -> Result<(), BackendError>;
    fn is_running(&self, name: &str) -> bool;
    /// Ask the window's owner to close (WM_CLOSE or equivalent).
    fn terminate_gracefully(&self, window: WindowId) -> Result<(), BackendError>;
    fn kill(&self, name: &str) -> Result<(), BackendError>;
}

/// Everything the engine needs from the desktop.
pub trait Platform: ScreenCapture + InputDevice + WindowManager + ProcessManager {}

impl<T> Platform for T where T: ScreenCapture + InputDevice + WindowManager + ProcessManager {}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognizedText {
    pub text: String,
    pub confidence: f32,
    /// Location relative to the recognized image.
    pub location: Rect,
}

pub trait TextRecognizer: Send + Sync {
    fn recognize(&self, image: &RgbaImage, hints: &[Rect]) -> Result<Vec<RecognizedText>, BackendError>;
}

/// Everything known at the moment a failure is escalated.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FailureReport {
    pub tag: String,
    pub stage: String,
    pub reason: String,
    pub account: Option<String>,
    pub window: Option<String>,
    pub attempts: Vec<ClickAttemptResult>,
    pub stack_info: Option<String>,
    #[serde(skip)]
    pub screenshot: Option<RgbaImage>,
    #[serde(skip)]
    pub html: Option<String>,
}

/// Fire-and-forget: implementations swallow their own errors.
pub trait EvidenceSink: Send + Sync {
    fn record_failure(&self, report: &FailureReport);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Success,
    Failure(String),
}

pub trait Authenticator: Send + Sync {
    fn perform_login(&self, credentials: &Credentials) -> LoginOutcome;
}

/// The external collaborators one engine instance works against.
#[derive(Clone)]
pub struct Collaborators {
    pub platform: Arc<dyn Platform>,
    pub recognizer: Arc<dyn TextRecognizer>,
    pub evidence: Arc<dyn EvidenceSink>,
    pub auth: Arc<dyn Authenticator>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Wire every desktop-facing collaborator to the simulated desktop.
    pub fn from_stub(stub: Arc<stub::StubPlatform>, evidence: Arc<dyn EvidenceSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            platform: stub.clone(),
            recognizer: stub.clone(),
            auth: stub,
            evidence,
            clock,
        }
    }
}

/// Create the platform appropriate for the current OS.
pub fn create_platform() -> Arc<stub::StubPlatform> {
    warn!("no native desktop backend compiled in, using the simulated desktop");
    Arc::new(stub::StubPlatform::new(Rect::new(0, 0, 1920, 1040)))
}

/// Normalized process name: file name only, lower-case, `.exe` stripped.
pub fn process_name(path_or_name: &str) -> String {
    let file = path_or_name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(path_or_name)
        .trim()
        .to_lowercase();
    match file.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => file,
    }
}
