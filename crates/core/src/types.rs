use std::fmt;

use image::RgbaImage;
use serde::{Deserialize, Serialize};

/// Window identifier (HWND on Windows, synthetic id on the stub desktop)
pub type WindowId = u64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn offset(self, dx: i32, dy: i32) -> Self {
        Self { x: self.x + dx, y: self.y + dy }
    }
}

/// Axis-aligned box: left, top, width, height.
/// Screen coordinates for windows and the work area, window-relative for
/// scene regions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub l: i32,
    pub t: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub fn new(l: i32, t: i32, w: i32, h: i32) -> Self {
        Self { l, t, w, h }
    }

    /// Exclusive right edge.
    pub fn r(&self) -> i32 {
        self.l + self.w
    }

    /// Exclusive bottom edge.
    pub fn b(&self) -> i32 {
        self.t + self.h
    }

    pub fn origin(&self) -> Point {
        Point::new(self.l, self.t)
    }

    pub fn center(&self) -> Point {
        Point::new(self.l + self.w / 2, self.t + self.h / 2)
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.l && p.x < self.r() && p.y >= self.t && p.y < self.b()
    }

    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }

    /// Shrink by `pad` on every side. Never goes negative.
    pub fn inset(&self, pad: i32) -> Rect {
        Rect {
            l: self.l + pad,
            t: self.t + pad,
            w: (self.w - 2 * pad).max(0),
            h: (self.h - 2 * pad).max(0),
        }
    }

    pub fn translate(&self, dx: i32, dy: i32) -> Rect {
        Rect { l: self.l + dx, t: self.t + dy, ..*self }
    }

    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let l = self.l.max(other.l);
        let t = self.t.max(other.t);
        let r = self.r().min(other.r());
        let b = self.b().min(other.b());
        if r <= l || b <= t {
            return None;
        }
        Some(Rect::new(l, t, r - l, b - t))
    }

    /// Centered sub-rect covering `ratio` of each dimension.
    pub fn centered(&self, ratio: f32) -> Rect {
        let ratio = ratio.clamp(0.05, 1.0);
        let w = ((self.w as f32) * ratio).round() as i32;
        let h = ((self.h as f32) * ratio).round() as i32;
        Rect::new(self.l + (self.w - w) / 2, self.t + (self.h - h) / 2, w, h)
    }
}

/// A captured image of (part of) a window.
#[derive(Debug, Clone)]
pub struct Capture {
    pub window: WindowId,
    pub image: RgbaImage,
    /// Captured area, relative to the window origin.
    pub region: Rect,
    /// Window geometry in screen coordinates at capture time.
    pub window_rect: Rect,
}

impl Capture {
    /// Client resolution used to pick a resolution-specific rule set.
    pub fn resolution(&self) -> (u32, u32) {
        (self.window_rect.w.max(0) as u32, self.window_rect.h.max(0) as u32)
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum AccountOutcome {
    Succeeded,
    Failed(String),
    Manual(String),
}

/// One entry of the account pool
#[derive(Debug, Clone)]
pub struct AccountRecord {
    pub id: String,
    pub credentials: Credentials,
    pub enabled: bool,
    /// Recoverable failures seen in the current cycle.
    pub retries: u32,
    pub last_outcome: Option<AccountOutcome>,
}

impl AccountRecord {
    pub fn new(id: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            credentials: Credentials { username: username.into(), password: password.into() },
            enabled: true,
            retries: 0,
            last_outcome: None,
        }
    }
}
