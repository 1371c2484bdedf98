use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use image::{imageops, RgbaImage};
use tracing::info;

use crate::error::BackendError;
use crate::types::*;
use super::*;

/// Hotspot target that closes the window and ends its process.
pub const CLOSE: &str = "<close>";

/// Clickable area of a simulated screen (window-relative).
#[derive(Debug, Clone)]
pub struct Hotspot {
    pub rect: Rect,
    pub goto: String,
}

/// One state a simulated window can show.
#[derive(Debug, Clone)]
pub struct StubScreen {
    pub name: String,
    pub image: RgbaImage,
    pub hotspots: Vec<Hotspot>,
    pub keys: HashMap<String, String>,
    pub texts: Vec<RecognizedText>,
    pub after_captures: Option<(u32, String)>,
    pub on_login: Option<String>,
}

impl StubScreen {
    pub fn new(name: impl Into<String>, image: RgbaImage) -> Self {
        Self {
            name: name.into(),
            image,
            hotspots: Vec::new(),
            keys: HashMap::new(),
            texts: Vec::new(),
            after_captures: None,
            on_login: None,
        }
    }

    pub fn hotspot(mut self, rect: Rect, goto: impl Into<String>) -> Self {
        self.hotspots.push(Hotspot { rect, goto: goto.into() });
        self
    }

    pub fn key(mut self, sequence: impl Into<String>, goto: impl Into<String>) -> Self {
        self.keys.insert(sequence.into(), goto.into());
        self
    }

    pub fn text(mut self, text: impl Into<String>, confidence: f32, location: Rect) -> Self {
        self.texts.push(RecognizedText { text: text.into(), confidence, location });
        self
    }

    /// Switch to `goto` once the screen has been captured `n` times.
    pub fn after_captures(mut self, n: u32, goto: impl Into<String>) -> Self {
        self.after_captures = Some((n, goto.into()));
        self
    }

    pub fn on_login(mut self, goto: impl Into<String>) -> Self {
        self.on_login = Some(goto.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct StubWindow {
    pub id: WindowId,
    pub title: String,
    pub process: String,
    pub rect: Rect,
    pub screen: String,
    captures: u32,
}

#[derive(Debug, Clone)]
pub struct Launcher {
    pub title: String,
    pub rect: Rect,
    pub screen: String,
}

/// In-memory desktop state. Windows are kept in z-order, the last one is
/// in the foreground.
#[derive(Debug, Default)]
pub struct StubDesktop {
    pub work_area: Rect,
    pub windows: Vec<StubWindow>,
    pub screens: HashMap<String, StubScreen>,
    pub launchers: HashMap<String, Launcher>,
    pub processes: HashSet<String>,
    pub clipboard: Option<String>,
    /// Number of upcoming foreground requests that silently do nothing.
    pub focus_denials: u32,
    pub immovable: HashSet<WindowId>,
    /// Processes that ignore graceful close requests.
    pub stubborn: HashSet<String>,
    pub failing_logins: HashSet<String>,
    pub capture_unavailable: bool,
    /// Number of upcoming clicks the input device rejects.
    pub click_failures: u32,
    pub clicks: Vec<Point>,
    pub keys: Vec<String>,
    pub moves: Vec<(WindowId, Point)>,
    pub logins: Vec<String>,
    pub launches: Vec<String>,
    pub kills: Vec<String>,
    last_capture: Option<(String, Rect)>,
    next_id: WindowId,
}

impl StubDesktop {
    fn window(&self, id: WindowId) -> Result<&StubWindow, BackendError> {
        self.windows.iter().find(|w| w.id == id).ok_or(BackendError::WindowGone(id))
    }

    fn window_mut(&mut self, id: WindowId) -> Result<&mut StubWindow, BackendError> {
        self.windows.iter_mut().find(|w| w.id == id).ok_or(BackendError::WindowGone(id))
    }

    fn goto(&mut self, id: WindowId, target: &str) {
        if target == CLOSE {
            if let Some(pos) = self.windows.iter().position(|w| w.id == id) {
                let win = self.windows.remove(pos);
                self.processes.remove(&win.process);
            }
            return;
        }
        if let Ok(win) = self.window_mut(id) {
            win.screen = target.to_string();
            win.captures = 0;
        }
    }

    fn topmost_at(&self, p: Point) -> Option<&StubWindow> {
        self.windows.iter().rev().find(|w| w.rect.contains(p))
    }

    pub fn screen_of(&self, id: WindowId) -> Option<&str> {
        self.windows.iter().find(|w| w.id == id).map(|w| w.screen.as_str())
    }
}

/// Simulated desktop implementing every collaborator trait.
pub struct StubPlatform {
    desk: Mutex<StubDesktop>,
}

impl StubPlatform {
    pub fn new(work_area: Rect) -> Self {
        let desk = StubDesktop { work_area, next_id: 1000, ..Default::default() };
        Self { desk: Mutex::new(desk) }
    }

    pub fn add_screen(&self, screen: StubScreen) {
        let mut d = self.desk.lock().unwrap();
        d.screens.insert(screen.name.clone(), screen);
    }

    pub fn add_launcher(&self, process: &str, title: &str, rect: Rect, screen: &str) {
        let mut d = self.desk.lock().unwrap();
        d.launchers.insert(
            process_name(process),
            Launcher { title: title.into(), rect, screen: screen.into() },
        );
    }

    /// Open a window directly, as if its process was already running.
    pub fn open_window(&self, title: &str, process: &str, rect: Rect, screen: &str) -> WindowId {
        let mut d = self.desk.lock().unwrap();
        Self::spawn(&mut d, title, &process_name(process), rect, screen)
    }

    fn spawn(d: &mut StubDesktop, title: &str, process: &str, rect: Rect, screen: &str) -> WindowId {
        d.next_id += 1;
        let id = d.next_id;
        d.processes.insert(process.to_string());
        d.windows.push(StubWindow {
            id,
            title: title.to_string(),
            process: process.to_string(),
            rect,
            screen: screen.to_string(),
            captures: 0,
        });
        id
    }

    pub fn set_screen(&self, window: WindowId, screen: &str) {
        self.desk.lock().unwrap().goto(window, screen);
    }

    pub fn inspect<R>(&self, f: impl FnOnce(&StubDesktop) -> R) -> R {
        f(&self.desk.lock().unwrap())
    }

    pub fn update(&self, f: impl FnOnce(&mut StubDesktop)) {
        f(&mut self.desk.lock().unwrap())
    }
}

impl ScreenCapture for StubPlatform {
    fn capture_region(&self, window: WindowId, rect: Option<Rect>) -> Result<Capture, BackendError> {
        let mut d = self.desk.lock().unwrap();
        if d.capture_unavailable {
            return Err(BackendError::Unavailable("capture device lost".into()));
        }
        let win = d.window(window)?.clone();
        let full = Rect::new(0, 0, win.rect.w, win.rect.h);
        let region = rect.and_then(|r| r.intersect(&full)).unwrap_or(full);
        let image = match d.screens.get(&win.screen) {
            Some(s) => imageops::crop_imm(
                &s.image,
                region.l as u32,
                region.t as u32,
                region.w as u32,
                region.h as u32,
            )
            .to_image(),
            None => RgbaImage::new(region.w as u32, region.h as u32),
        };

        d.last_capture = Some((win.screen.clone(), region));
        let transition = d.screens.get(&win.screen).and_then(|s| s.after_captures.clone());
        let captures = {
            let w = d.window_mut(window)?;
            w.captures += 1;
            w.captures
        };
        if let Some((n, goto)) = transition {
            if captures >= n {
                d.goto(window, &goto);
            }
        }

        Ok(Capture { window, image, region, window_rect: win.rect })
    }
}

impl InputDevice for StubPlatform {
    fn click(&self, at: Point) -> Result<(), BackendError> {
        let mut d = self.desk.lock().unwrap();
        if d.click_failures > 0 {
            d.click_failures -= 1;
            return Err(BackendError::Failed("input rejected".into()));
        }
        info!(x = at.x, y = at.y, "click");
        d.clicks.push(at);
        if !d.work_area.contains(at) {
            return Ok(());
        }
        let Some(win) = d.topmost_at(at).cloned() else { return Ok(()) };
        let local = Point::new(at.x - win.rect.l, at.y - win.rect.t);
        let goto = d
            .screens
            .get(&win.screen)
            .and_then(|s| s.hotspots.iter().find(|h| h.rect.contains(local)))
            .map(|h| h.goto.clone());
        if let Some(goto) = goto {
            d.goto(win.id, &goto);
        }
        Ok(())
    }

    fn send_keys(&self, sequence: &str) -> Result<(), BackendError> {
        let mut d = self.desk.lock().unwrap();
        info!(sequence, "send_keys");
        d.keys.push(sequence.to_string());
        let Some(win) = d.windows.last().cloned() else { return Ok(()) };
        let goto = d.screens.get(&win.screen).and_then(|s| s.keys.get(sequence)).cloned();
        if let Some(goto) = goto {
            d.goto(win.id, &goto);
        }
        Ok(())
    }

    fn set_clipboard_text(&self, text: &str) -> Result<(), BackendError> {
        self.desk.lock().unwrap().clipboard = Some(text.to_string());
        Ok(())
    }

    fn clipboard_text(&self) -> Result<Option<String>, BackendError> {
        Ok(self.desk.lock().unwrap().clipboard.clone())
    }

    fn clear_clipboard(&self) -> Result<(), BackendError> {
        self.desk.lock().unwrap().clipboard = None;
        Ok(())
    }
}

impl WindowManager for StubPlatform {
    fn find_window(&self, keyword: &str) -> Option<WindowId> {
        let d = self.desk.lock().unwrap();
        let kw = keyword.to_lowercase();
        d.windows.iter().rev().find(|w| w.title.to_lowercase().contains(&kw)).map(|w| w.id)
    }

    fn foreground_window(&self) -> Option<WindowId> {
        self.desk.lock().unwrap().windows.last().map(|w| w.id)
    }

    fn window_title(&self, window: WindowId) -> Option<String> {
        self.desk.lock().unwrap().window(window).ok().map(|w| w.title.clone())
    }

    fn bring_to_foreground(&self, window: WindowId) -> Result<(), BackendError> {
        let mut d = self.desk.lock().unwrap();
        let pos = d
            .windows
            .iter()
            .position(|w| w.id == window)
            .ok_or(BackendError::WindowGone(window))?;
        if d.focus_denials > 0 {
            d.focus_denials -= 1;
            return Ok(());
        }
        let win = d.windows.remove(pos);
        d.windows.push(win);
        Ok(())
    }

    fn window_rect(&self, window: WindowId) -> Result<Rect, BackendError> {
        Ok(self.desk.lock().unwrap().window(window)?.rect)
    }

    fn move_window(&self, window: WindowId, to: Point) -> Result<(), BackendError> {
        let mut d = self.desk.lock().unwrap();
        info!(window, x = to.x, y = to.y, "move_window");
        d.moves.push((window, to));
        if d.immovable.contains(&window) {
            return Ok(());
        }
        let win = d.window_mut(window)?;
        win.rect.l = to.x;
        win.rect.t = to.y;
        Ok(())
    }

    fn visible_work_area(&self) -> Result<Rect, BackendError> {
        Ok(self.desk.lock().unwrap().work_area)
    }
}

impl ProcessManager for StubPlatform {
    fn start_process(&self, path: &Path) -> Result<(), BackendError> {
        let mut d = self.desk.lock().unwrap();
        let name = process_name(&path.to_string_lossy());
        info!(process = %name, "start_process");
        d.launches.push(name.clone());
        let launcher = d
            .launchers
            .get(&name)
            .cloned()
            .ok_or_else(|| BackendError::Failed(format!("no such program: {}", path.display())))?;
        Self::spawn(&mut d, &launcher.title, &name, launcher.rect, &launcher.screen);
        Ok(())
    }

    fn is_running(&self, name: &str) -> bool {
        self.desk.lock().unwrap().processes.contains(&process_name(name))
    }

    fn terminate_gracefully(&self, window: WindowId) -> Result<(), BackendError> {
        let mut d = self.desk.lock().unwrap();
        let process = d.window(window)?.process.clone();
        if d.stubborn.contains(&process) {
            return Ok(());
        }
        d.goto(window, CLOSE);
        Ok(())
    }

    fn kill(&self, name: &str) -> Result<(), BackendError> {
        let mut d = self.desk.lock().unwrap();
        let name = process_name(name);
        d.kills.push(name.clone());
        d.windows.retain(|w| w.process != name);
        d.processes.remove(&name);
        Ok(())
    }
}

impl TextRecognizer for StubPlatform {
    /// Returns the texts of the last captured screen that fall inside the
    /// captured area, relative to it.
    fn recognize(&self, _image: &RgbaImage, hints: &[Rect]) -> Result<Vec<RecognizedText>, BackendError> {
        let d = self.desk.lock().unwrap();
        let Some((screen, region)) = d.last_capture.clone() else { return Ok(Vec::new()) };
        let Some(screen) = d.screens.get(&screen) else { return Ok(Vec::new()) };
        let found = screen
            .texts
            .iter()
            .filter(|t| region.intersect(&t.location) == Some(t.location))
            .map(|t| RecognizedText { location: t.location.translate(-region.l, -region.t), ..t.clone() })
            .filter(|t| hints.is_empty() || hints.iter().any(|h| h.intersect(&t.location).is_some()))
            .collect();
        Ok(found)
    }
}

impl Authenticator for StubPlatform {
    fn perform_login(&self, credentials: &Credentials) -> LoginOutcome {
        let mut d = self.desk.lock().unwrap();
        d.logins.push(credentials.username.clone());
        if d.failing_logins.contains(&credentials.username) {
            return LoginOutcome::Failure("credentials rejected".into());
        }
        let Some(win) = d.windows.last().cloned() else {
            return LoginOutcome::Failure("no client window".into());
        };
        let goto = d.screens.get(&win.screen).and_then(|s| s.on_login.clone());
        if let Some(goto) = goto {
            d.goto(win.id, &goto);
        }
        LoginOutcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desk() -> (StubPlatform, WindowId) {
        let p = StubPlatform::new(Rect::new(0, 0, 800, 560));
        p.add_screen(StubScreen::new("a", RgbaImage::new(100, 80)).hotspot(Rect::new(10, 10, 20, 20), "b"));
        p.add_screen(StubScreen::new("b", RgbaImage::new(100, 80)).key("esc", CLOSE));
        let w = p.open_window("Client", "client.exe", Rect::new(100, 100, 100, 80), "a");
        (p, w)
    }

    #[test]
    fn hotspot_click_switches_screen() {
        let (p, w) = desk();
        p.click(Point::new(115, 115)).unwrap();
        assert_eq!(p.inspect(|d| d.screen_of(w).map(str::to_string)), Some("b".into()));
        p.send_keys("esc").unwrap();
        assert!(p.find_window("client").is_none());
        assert!(!p.is_running("client"));
    }

    #[test]
    fn clicks_outside_work_area_do_nothing() {
        let (p, w) = desk();
        p.update(|d| d.work_area = Rect::new(0, 0, 105, 105));
        p.click(Point::new(115, 115)).unwrap();
        assert_eq!(p.inspect(|d| d.screen_of(w).map(str::to_string)), Some("a".into()));
    }

    #[test]
    fn find_window_prefers_most_recent() {
        let (p, first) = desk();
        let second = p.open_window("Client #2", "client.exe", Rect::new(0, 0, 100, 80), "a");
        assert_eq!(p.find_window("client"), Some(second));
        p.bring_to_foreground(first).unwrap();
        assert_eq!(p.find_window("CLIENT"), Some(first));
    }

    #[test]
    fn recognizer_translates_into_capture() {
        let (p, w) = desk();
        p.update(|d| {
            let s = d.screens.get_mut("a").unwrap();
            s.texts.push(RecognizedText { text: "OK".into(), confidence: 0.9, location: Rect::new(40, 30, 10, 8) });
        });
        let cap = p.capture_region(w, Some(Rect::new(20, 20, 60, 40))).unwrap();
        let texts = p.recognize(&cap.image, &[]).unwrap();
        assert_eq!(texts.len(), 1);
        assert_eq!(texts[0].location, Rect::new(20, 10, 10, 8));
    }
}
