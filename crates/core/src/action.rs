use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::{millis, Clock};
use crate::error::{BackendError, EngineError};
use crate::platform::Platform;
use crate::settings::{ClickSettings, RecoverSettings};
use crate::types::*;

pub const OK_WITHOUT_VERIFY: &str = "ok_without_verify";
pub const OK_VERIFIED: &str = "ok_verified";
pub const FOREGROUND_CHECK_FAILED: &str = "activate_or_foreground_check_failed";
pub const OUTSIDE_WORK_AREA: &str = "candidate_outside_work_area";
pub const FOREGROUND_LOST: &str = "foreground_lost_after_click";
pub const VERIFY_FAILED: &str = "verify_failed";
pub const CLICK_FAILED: &str = "click_failed";
pub const ROUNDS_EXHAUSTED: &str = "click_rounds_exhausted";
pub const TARGET_OFF_SCREEN: &str = "target_outside_work_area";
pub const GEOMETRY_EXHAUSTED: &str = "geometry_recovery_exhausted";
pub const OCR_FALLBACK_OK: &str = "ocr_fallback_success";
pub const OCR_FALLBACK_ERROR: &str = "ocr_fallback_error";

/// One physical (or skipped) click.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClickAttemptResult {
    pub success: bool,
    pub point: Option<Point>,
    pub round: u32,
    /// Index into the round's candidates, center first. `None` for the
    /// foreground check and the keyword fallback.
    pub offset_index: Option<usize>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClickResult {
    pub success: bool,
    pub attempts: Vec<ClickAttemptResult>,
    pub final_reason: String,
    pub success_point: Option<Point>,
}

impl ClickResult {
    fn finish(mut self, success: bool, reason: impl Into<String>) -> Self {
        self.success = success;
        self.final_reason = reason.into();
        self
    }

    /// Attempts that actually pressed the mouse.
    pub fn clicks(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.point.is_some() && a.reason != OUTSIDE_WORK_AREA && !a.reason.starts_with(CLICK_FAILED))
            .count()
    }
}

/// A logical click target.
#[derive(Debug, Clone, Copy)]
pub struct ClickTarget<'a> {
    pub window: WindowId,
    /// Expected (substring of the) foreground window title.
    pub title: &'a str,
    /// Window-relative region.
    pub region: Rect,
    pub label: &'a str,
}

/// Post-click check: did the intended effect happen?
pub type Verify<'v> = &'v mut dyn FnMut(Point) -> Result<bool, EngineError>;

/// Last resort once every round failed: find something clickable by other
/// means.
pub trait ClickFallback {
    /// Window-relative rect to click, if anything qualifies.
    fn find_target(&self, window: WindowId) -> Result<Option<Rect>, EngineError>;
}

/// Executes single logical actions with bounded retries. Every loop in
/// here is capped by configuration.
pub struct Actor<'a> {
    platform: &'a dyn Platform,
    clock: &'a dyn Clock,
    click: &'a ClickSettings,
    recover: &'a RecoverSettings,
    fallback: Option<&'a dyn ClickFallback>,
}

impl<'a> Actor<'a> {
    pub fn new(platform: &'a dyn Platform, clock: &'a dyn Clock, click: &'a ClickSettings, recover: &'a RecoverSettings) -> Self {
        Self { platform, clock, click, recover, fallback: None }
    }

    /// Used after the last round when `ocr_fallback` is on.
    pub fn with_fallback(mut self, fallback: &'a dyn ClickFallback) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Click `target`, trying the region center and the configured offsets
    /// for up to `max_rounds` rounds. Physical clicks never exceed
    /// `candidates x max_rounds`, plus one keyword fallback click.
    pub fn perform_click(&self, target: &ClickTarget, mut verify: Option<Verify>) -> Result<ClickResult, EngineError> {
        let mut result = ClickResult::default();
        let mut recoveries = 0u32;
        let rounds = self.click.max_rounds.max(1);

        for round in 1..=rounds {
            if round > 1 {
                self.clock.sleep(self.backoff(round - 1));
            }

            if !self.ensure_foreground(target.window, target.title)? {
                warn!(label = target.label, window = target.window, round, "foreground check failed");
                result.attempts.push(ClickAttemptResult {
                    success: false,
                    point: None,
                    round,
                    offset_index: None,
                    reason: FOREGROUND_CHECK_FAILED.into(),
                });
                continue;
            }

            let mut candidates = self.candidates(target)?;
            if candidates.iter().all(|(_, _, visible)| !visible) {
                result.attempts.push(ClickAttemptResult {
                    success: false,
                    point: None,
                    round,
                    offset_index: None,
                    reason: OUTSIDE_WORK_AREA.into(),
                });
                if !self.recover.enabled {
                    return Ok(result.finish(false, TARGET_OFF_SCREEN));
                }
                while candidates.iter().all(|(_, _, visible)| !visible) {
                    if recoveries >= self.recover.max_attempts {
                        let reason = format!("{}: {} move attempts", GEOMETRY_EXHAUSTED, recoveries);
                        warn!(label = target.label, %reason, "giving up");
                        return Ok(result.finish(false, reason));
                    }
                    if recoveries > 0 {
                        self.clock.sleep(millis(self.recover.cooldown_ms));
                    }
                    recoveries += 1;
                    self.reposition(target)?;
                    candidates = self.candidates(target)?;
                }
            }

            for (idx, point, visible) in candidates {
                if !visible {
                    result.attempts.push(ClickAttemptResult {
                        success: false,
                        point: Some(point),
                        round,
                        offset_index: Some(idx),
                        reason: OUTSIDE_WORK_AREA.into(),
                    });
                    continue;
                }

                if let Some(reason) = self.press(point)? {
                    warn!(label = target.label, round, offset_index = idx, %reason, "click not delivered");
                    result.attempts.push(ClickAttemptResult {
                        success: false,
                        point: Some(point),
                        round,
                        offset_index: Some(idx),
                        reason,
                    });
                    continue;
                }

                let foreground = self.platform.foreground_window();
                let reason = if self.click.verify_foreground && foreground != Some(target.window) {
                    FOREGROUND_LOST
                } else {
                    match verify.as_deref_mut() {
                        None => OK_WITHOUT_VERIFY,
                        Some(check) => {
                            if check(point)? {
                                OK_VERIFIED
                            } else {
                                VERIFY_FAILED
                            }
                        }
                    }
                };
                let success = reason == OK_WITHOUT_VERIFY || reason == OK_VERIFIED;
                info!(
                    label = target.label,
                    round,
                    offset_index = idx,
                    x = point.x,
                    y = point.y,
                    foreground = ?foreground,
                    reason,
                    "click attempt"
                );
                result.attempts.push(ClickAttemptResult {
                    success,
                    point: Some(point),
                    round,
                    offset_index: Some(idx),
                    reason: reason.into(),
                });
                if success {
                    result.success_point = Some(point);
                    return Ok(result.finish(true, reason));
                }
            }
        }

        let exhausted = if result.attempts.iter().all(|a| a.reason == FOREGROUND_CHECK_FAILED) {
            FOREGROUND_CHECK_FAILED
        } else {
            ROUNDS_EXHAUSTED
        };

        let fallback = self.fallback.filter(|_| self.click.ocr_fallback && exhausted == ROUNDS_EXHAUSTED);
        if let Some(fallback) = fallback {
            if let Some(point) = self.fallback_click(fallback, target, rounds, &mut result)? {
                let ok = match verify.as_deref_mut() {
                    None => true,
                    Some(check) => check(point)?,
                };
                warn!(label = target.label, x = point.x, y = point.y, ok, "keyword fallback click");
                result.attempts.push(ClickAttemptResult {
                    success: ok,
                    point: Some(point),
                    round: rounds,
                    offset_index: None,
                    reason: if ok { OCR_FALLBACK_OK } else { VERIFY_FAILED }.into(),
                });
                if ok {
                    result.success_point = Some(point);
                    return Ok(result.finish(true, OCR_FALLBACK_OK));
                }
            }
        }

        Ok(result.finish(false, exhausted))
    }

    /// Mouse press plus the settle delay. A rejected click comes back as an
    /// attempt reason, only an unavailable backend is an error.
    fn press(&self, point: Point) -> Result<Option<String>, EngineError> {
        match self.platform.click(point) {
            Ok(()) => {
                self.clock.sleep(millis(self.click.post_click_delay_ms));
                Ok(None)
            }
            Err(e @ BackendError::Unavailable(_)) => Err(e.into()),
            Err(e) => Ok(Some(format!("{}: {}", CLICK_FAILED, e))),
        }
    }

    /// Locate and press the fallback target. Returns the pressed point;
    /// misses and errors are recorded in `result`.
    fn fallback_click(
        &self,
        fallback: &dyn ClickFallback,
        target: &ClickTarget,
        round: u32,
        result: &mut ClickResult,
    ) -> Result<Option<Point>, EngineError> {
        let mut record = |point: Option<Point>, reason: String| {
            result.attempts.push(ClickAttemptResult { success: false, point, round, offset_index: None, reason });
        };
        let rect = match fallback.find_target(target.window) {
            Ok(Some(rect)) => rect,
            Ok(None) => {
                debug!(label = target.label, "nothing for the keyword fallback");
                return Ok(None);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                record(None, format!("{}: {}", OCR_FALLBACK_ERROR, e));
                return Ok(None);
            }
        };
        let win = self.platform.window_rect(target.window)?;
        let point = rect.center().offset(win.l, win.t);
        if !self.platform.visible_work_area()?.inset(self.click.guard_padding).contains(point) {
            record(Some(point), OUTSIDE_WORK_AREA.into());
            return Ok(None);
        }
        match self.press(point)? {
            None => Ok(Some(point)),
            Some(reason) => {
                record(Some(point), reason);
                Ok(None)
            }
        }
    }

    /// Configured delay after a failed round (1-based).
    pub fn backoff(&self, round: u32) -> Duration {
        let steps = &self.click.backoff_ms;
        if steps.is_empty() {
            return Duration::ZERO;
        }
        let idx = (round.saturating_sub(1) as usize).min(steps.len() - 1);
        millis(steps[idx])
    }

    /// Screen-space candidates for this round, the region center first,
    /// each flagged with whether it passes the visibility guard.
    fn candidates(&self, target: &ClickTarget) -> Result<Vec<(usize, Point, bool)>, EngineError> {
        let win = self.platform.window_rect(target.window)?;
        let guard = self.platform.visible_work_area()?.inset(self.click.guard_padding);
        let center = target.region.center().offset(win.l, win.t);
        let offsets = &self.click.candidate_offsets;
        let lead = (!offsets.contains(&(0, 0))).then_some(&(0, 0));
        Ok(lead
            .into_iter()
            .chain(offsets.iter())
            .enumerate()
            .map(|(i, (dx, dy))| {
                let p = center.offset(*dx, *dy);
                (i, p, guard.contains(p))
            })
            .collect())
    }

    /// Move (never resize) the window so the target center lands in the
    /// work area. Per axis: clamp the whole window when it fits, otherwise
    /// shift just enough to bring the target in.
    fn reposition(&self, target: &ClickTarget) -> Result<(), EngineError> {
        let win = self.platform.window_rect(target.window)?;
        let area = self.platform.visible_work_area()?.inset(self.recover.padding);
        let center = target.region.center().offset(win.l, win.t);

        let axis = |pos: i32, size: i32, lo: i32, hi: i32, c: i32| -> i32 {
            if size <= hi - lo {
                pos.clamp(lo, hi - size)
            } else if c < lo {
                pos + (lo - c)
            } else if c >= hi {
                pos - (c - hi + 1)
            } else {
                pos
            }
        };
        let to = Point::new(
            axis(win.l, win.w, area.l, area.r(), center.x),
            axis(win.t, win.h, area.t, area.b(), center.y),
        );
        info!(label = target.label, from_x = win.l, from_y = win.t, to_x = to.x, to_y = to.y, "repositioning window");
        self.platform.move_window(target.window, to)?;
        Ok(())
    }

    /// Bring the window forward and confirm it by title.
    fn ensure_foreground(&self, window: WindowId, title: &str) -> Result<bool, EngineError> {
        self.platform.bring_to_foreground(window)?;
        self.clock.sleep(millis(self.click.foreground_wait_ms));
        if !self.click.verify_foreground {
            return Ok(true);
        }
        if self.platform.foreground_window() != Some(window) {
            return Ok(false);
        }
        let actual = self.platform.window_title(window).unwrap_or_default();
        Ok(actual.to_lowercase().contains(&title.to_lowercase()))
    }

    /// Foreground check with the click backoff between tries, then send.
    pub fn perform_key_sequence(&self, window: WindowId, title: &str, sequence: &str) -> Result<bool, EngineError> {
        for round in 1..=self.click.max_rounds.max(1) {
            if self.ensure_foreground(window, title)? {
                self.platform.send_keys(sequence)?;
                debug!(sequence, round, "keys sent");
                return Ok(true);
            }
            if round < self.click.max_rounds {
                self.clock.sleep(self.backoff(round));
            }
        }
        warn!(sequence, "keys not sent, window never reached the foreground");
        Ok(false)
    }

    /// Paste `text` through the clipboard, restoring its previous content.
    pub fn paste_text(&self, window: WindowId, title: &str, text: &str) -> Result<bool, EngineError> {
        let _guard = ClipboardGuard::capture(self.platform)?;
        self.platform.set_clipboard_text(text)?;
        self.perform_key_sequence(window, title, "ctrl+v")
    }
}

/// Restores the clipboard on every exit path.
struct ClipboardGuard<'a> {
    platform: &'a dyn Platform,
    previous: Option<String>,
}

impl<'a> ClipboardGuard<'a> {
    fn capture(platform: &'a dyn Platform) -> Result<Self, BackendError> {
        Ok(Self { platform, previous: platform.clipboard_text()? })
    }
}

impl Drop for ClipboardGuard<'_> {
    fn drop(&mut self) {
        let restored = match self.previous.take() {
            Some(text) => self.platform.set_clipboard_text(&text),
            None => self.platform.clear_clipboard(),
        };
        if let Err(e) = restored {
            warn!(error = %e, "failed to restore clipboard");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::stub::StubScreen;
    use crate::platform::{InputDevice, WindowManager};
    use crate::testutil::*;

    const TARGET: Rect = Rect { l: 100, t: 80, w: 30, h: 20 };

    fn setup(window_at: Rect) -> (Harness, WindowId) {
        let h = harness();
        h.stub.add_screen(StubScreen::new("a", noise(160, 120, 1)).hotspot(TARGET, "b"));
        h.stub.add_screen(StubScreen::new("b", noise(160, 120, 2)));
        let w = h.stub.open_window("Client", "client", window_at, "a");
        (h, w)
    }

    fn target(w: WindowId) -> ClickTarget<'static> {
        ClickTarget { window: w, title: "client", region: TARGET, label: "start" }
    }

    fn screen(h: &Harness, w: WindowId) -> String {
        h.stub.inspect(|d| d.screen_of(w).unwrap_or_default().to_string())
    }

    #[test]
    fn first_candidate_is_the_center() {
        let (h, w) = setup(WINDOW);
        let s = crate::settings::Settings::default();
        let actor = Actor::new(h.stub.as_ref(), h.clock.as_ref(), &s.click, &s.recover);
        let r = actor.perform_click(&target(w), None).unwrap();
        assert!(r.success);
        assert_eq!(r.final_reason, OK_WITHOUT_VERIFY);
        assert_eq!(r.attempts.len(), 1);
        assert_eq!(r.attempts[0].offset_index, Some(0));
        assert_eq!(r.success_point, Some(Point::new(40 + 115, 40 + 90)));
        assert_eq!(screen(&h, w), "b");
    }

    #[test]
    fn failed_verification_is_bounded() {
        let (h, w) = setup(WINDOW);
        let s = crate::settings::Settings::default();
        let actor = Actor::new(h.stub.as_ref(), h.clock.as_ref(), &s.click, &s.recover);
        let mut calls = 0;
        let mut never = |_p: Point| -> Result<bool, EngineError> {
            calls += 1;
            Ok(false)
        };
        let r = actor.perform_click(&target(w), Some(&mut never)).unwrap();
        assert!(!r.success);
        assert_eq!(r.final_reason, ROUNDS_EXHAUSTED);
        assert_eq!(r.clicks(), 15);
        assert_eq!(h.stub.inspect(|d| d.clicks.len()), 15);
        assert_eq!(calls, 15);
        assert!(r.attempts.iter().all(|a| a.reason == VERIFY_FAILED));
        let offsets: Vec<_> = r.attempts[..5].iter().map(|a| a.offset_index.unwrap()).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);

        // backoff after rounds 1 and 2 only
        let sleeps = h.clock.sleeps();
        assert_eq!(sleeps.iter().filter(|d| **d == millis(250)).count(), 1);
        assert!(!sleeps.contains(&millis(500)));
    }

    #[test]
    fn verification_can_succeed_on_a_later_candidate() {
        let (h, w) = setup(WINDOW);
        let s = crate::settings::Settings::default();
        let actor = Actor::new(h.stub.as_ref(), h.clock.as_ref(), &s.click, &s.recover);
        let mut n = 0;
        let mut third = |_p: Point| -> Result<bool, EngineError> {
            n += 1;
            Ok(n == 3)
        };
        let r = actor.perform_click(&target(w), Some(&mut third)).unwrap();
        assert!(r.success);
        assert_eq!(r.final_reason, OK_VERIFIED);
        assert_eq!(r.attempts.last().unwrap().offset_index, Some(2));
    }

    #[test]
    fn foreground_failure_is_reported_not_swallowed() {
        let (h, w) = setup(WINDOW);
        let other = h.stub.open_window("Editor", "editor", Rect::new(0, 0, 400, 300), "b");
        h.stub.update(|d| d.focus_denials = 10);
        let s = crate::settings::Settings::default();
        let actor = Actor::new(h.stub.as_ref(), h.clock.as_ref(), &s.click, &s.recover);
        let r = actor.perform_click(&target(w), None).unwrap();
        assert!(!r.success);
        assert_eq!(r.final_reason, FOREGROUND_CHECK_FAILED);
        assert_eq!(r.attempts.len(), 3);
        assert!(r.attempts.iter().all(|a| a.offset_index.is_none() && a.reason == FOREGROUND_CHECK_FAILED));
        let rounds: Vec<_> = r.attempts.iter().map(|a| a.round).collect();
        assert_eq!(rounds, vec![1, 2, 3]);
        assert!(h.stub.inspect(|d| d.clicks.is_empty()));
        assert_eq!(h.stub.foreground_window(), Some(other));
    }

    #[test]
    fn transient_focus_theft_is_retried_next_round() {
        let (h, w) = setup(WINDOW);
        h.stub.open_window("Editor", "editor", Rect::new(0, 0, 400, 300), "b");
        h.stub.update(|d| d.focus_denials = 1);
        let s = crate::settings::Settings::default();
        let actor = Actor::new(h.stub.as_ref(), h.clock.as_ref(), &s.click, &s.recover);
        let r = actor.perform_click(&target(w), None).unwrap();
        assert!(r.success, "{:?}", r);
        assert_eq!(r.attempts.len(), 2);
        assert_eq!(r.attempts[0].reason, FOREGROUND_CHECK_FAILED);
        assert_eq!((r.attempts[1].round, r.attempts[1].offset_index), (2, Some(0)));
        assert_eq!(screen(&h, w), "b");
    }

    #[test]
    fn rejected_click_is_recorded_and_next_candidate_tried() {
        let (h, w) = setup(WINDOW);
        h.stub.update(|d| d.click_failures = 2);
        let s = crate::settings::Settings::default();
        let actor = Actor::new(h.stub.as_ref(), h.clock.as_ref(), &s.click, &s.recover);
        let r = actor.perform_click(&target(w), None).unwrap();
        assert!(r.success);
        assert_eq!(r.attempts.len(), 3);
        assert!(r.attempts[..2].iter().all(|a| a.reason.starts_with(CLICK_FAILED)));
        assert_eq!(r.attempts[2].offset_index, Some(2));
        assert_eq!(r.clicks(), 1);
        assert_eq!(h.stub.inspect(|d| d.clicks.len()), 1);
    }

    #[test]
    fn empty_offsets_still_click_the_center() {
        let (h, w) = setup(WINDOW);
        let mut s = crate::settings::Settings::default();
        s.click.candidate_offsets.clear();
        let actor = Actor::new(h.stub.as_ref(), h.clock.as_ref(), &s.click, &s.recover);
        let r = actor.perform_click(&target(w), None).unwrap();
        assert!(r.success, "{:?}", r);
        assert_eq!(r.attempts.len(), 1);
        assert_eq!(r.attempts[0].offset_index, Some(0));
        assert_eq!(r.success_point, Some(Point::new(40 + 115, 40 + 90)));
        assert!(h.stub.inspect(|d| d.moves.is_empty()));
    }

    #[test]
    fn center_leads_offsets_that_omit_it() {
        let (h, w) = setup(WINDOW);
        let mut s = crate::settings::Settings::default();
        s.click.candidate_offsets = vec![(5, 0)];
        s.click.max_rounds = 1;
        let actor = Actor::new(h.stub.as_ref(), h.clock.as_ref(), &s.click, &s.recover);
        let mut never = |_p: Point| -> Result<bool, EngineError> { Ok(false) };
        let r = actor.perform_click(&target(w), Some(&mut never)).unwrap();
        let points: Vec<_> = r.attempts.iter().map(|a| a.point.unwrap()).collect();
        assert_eq!(points, vec![Point::new(155, 130), Point::new(160, 130)]);
    }

    struct FixedSpot(Option<Rect>);

    impl ClickFallback for FixedSpot {
        fn find_target(&self, _window: WindowId) -> Result<Option<Rect>, EngineError> {
            Ok(self.0)
        }
    }

    #[test]
    fn keyword_fallback_runs_after_the_last_round() {
        let (h, w) = setup(WINDOW);
        let mut s = crate::settings::Settings::default();
        s.click.ocr_fallback = true;
        s.click.max_rounds = 1;
        let spot = FixedSpot(Some(Rect::new(10, 10, 20, 10)));
        let actor = Actor::new(h.stub.as_ref(), h.clock.as_ref(), &s.click, &s.recover).with_fallback(&spot);
        let mut pressed = Vec::new();
        let mut last_only = |p: Point| -> Result<bool, EngineError> {
            pressed.push(p);
            Ok(pressed.len() == 6)
        };
        let r = actor.perform_click(&target(w), Some(&mut last_only)).unwrap();
        assert!(r.success);
        assert_eq!(r.final_reason, OCR_FALLBACK_OK);
        let last = r.attempts.last().unwrap();
        assert_eq!((last.offset_index, last.point), (None, Some(Point::new(60, 55))));
        assert_eq!(r.clicks(), 6);
    }

    #[test]
    fn keyword_fallback_is_off_by_default_and_quiet_on_miss() {
        let (h, w) = setup(WINDOW);
        let mut s = crate::settings::Settings::default();
        s.click.max_rounds = 1;
        let spot = FixedSpot(Some(Rect::new(10, 10, 20, 10)));
        let mut never = |_p: Point| -> Result<bool, EngineError> { Ok(false) };
        let actor = Actor::new(h.stub.as_ref(), h.clock.as_ref(), &s.click, &s.recover).with_fallback(&spot);
        let r = actor.perform_click(&target(w), Some(&mut never)).unwrap();
        assert_eq!(r.final_reason, ROUNDS_EXHAUSTED);
        assert_eq!(r.clicks(), 5);

        s.click.ocr_fallback = true;
        let nothing = FixedSpot(None);
        let actor = Actor::new(h.stub.as_ref(), h.clock.as_ref(), &s.click, &s.recover).with_fallback(&nothing);
        let r = actor.perform_click(&target(w), Some(&mut never)).unwrap();
        assert_eq!(r.final_reason, ROUNDS_EXHAUSTED);
        assert_eq!(r.attempts.len(), 5);
    }

    #[test]
    fn off_screen_target_is_recovered_by_moving() {
        // target center lands at (815, 590), below and right of the work area
        let (h, w) = setup(Rect::new(700, 500, 160, 120));
        let s = crate::settings::Settings::default();
        let actor = Actor::new(h.stub.as_ref(), h.clock.as_ref(), &s.click, &s.recover);
        let r = actor.perform_click(&target(w), None).unwrap();
        assert!(r.success, "{:?}", r);
        assert_eq!(r.attempts[0].reason, OUTSIDE_WORK_AREA);
        let rect = h.stub.window_rect(w).unwrap();
        assert_eq!((rect.l, rect.t), (632, 432));
        assert_eq!((rect.w, rect.h), (160, 120));
        assert_eq!(screen(&h, w), "b");
    }

    #[test]
    fn immovable_window_exhausts_geometry_recovery() {
        let (h, w) = setup(Rect::new(700, 500, 160, 120));
        h.stub.update(|d| {
            d.immovable.insert(w);
        });
        let s = crate::settings::Settings::default();
        let actor = Actor::new(h.stub.as_ref(), h.clock.as_ref(), &s.click, &s.recover);
        let r = actor.perform_click(&target(w), None).unwrap();
        assert!(!r.success);
        assert!(r.final_reason.starts_with(GEOMETRY_EXHAUSTED), "{}", r.final_reason);
        assert_eq!(h.stub.inspect(|d| d.moves.len()), 2);
        assert!(h.stub.inspect(|d| d.clicks.is_empty()));
        assert_eq!(r.clicks(), 0);
    }

    #[test]
    fn recovery_disabled_fails_fast() {
        let (h, w) = setup(Rect::new(700, 500, 160, 120));
        let mut s = crate::settings::Settings::default();
        s.recover.enabled = false;
        let actor = Actor::new(h.stub.as_ref(), h.clock.as_ref(), &s.click, &s.recover);
        let r = actor.perform_click(&target(w), None).unwrap();
        assert_eq!(r.final_reason, TARGET_OFF_SCREEN);
        assert!(h.stub.inspect(|d| d.moves.is_empty()));
    }

    #[test]
    fn oversized_window_shifts_target_into_view() {
        let (h, w) = setup(Rect::new(-300, 0, 1000, 120));
        let s = crate::settings::Settings::default();
        let actor = Actor::new(h.stub.as_ref(), h.clock.as_ref(), &s.click, &s.recover);
        let region = Rect::new(10, 80, 30, 20);
        let t = ClickTarget { region, ..target(w) };
        let r = actor.perform_click(&t, None).unwrap();
        assert!(r.success);
        let rect = h.stub.window_rect(w).unwrap();
        assert!(rect.l + region.center().x >= 8);
        assert_eq!(rect.w, 1000);
    }

    #[test]
    fn paste_restores_clipboard() {
        let (h, w) = setup(WINDOW);
        h.stub.update(|d| d.clipboard = Some("user data".into()));
        let s = crate::settings::Settings::default();
        let actor = Actor::new(h.stub.as_ref(), h.clock.as_ref(), &s.click, &s.recover);
        assert!(actor.paste_text(w, "client", "secret").unwrap());
        assert_eq!(h.stub.inspect(|d| d.keys.clone()), vec!["ctrl+v".to_string()]);
        assert_eq!(h.stub.clipboard_text().unwrap(), Some("user data".into()));
    }

    #[test]
    fn paste_leaves_an_empty_clipboard_empty() {
        let (h, w) = setup(WINDOW);
        let s = crate::settings::Settings::default();
        let actor = Actor::new(h.stub.as_ref(), h.clock.as_ref(), &s.click, &s.recover);
        assert!(actor.paste_text(w, "client", "secret").unwrap());
        assert_eq!(h.stub.clipboard_text().unwrap(), None);
    }

    #[test]
    fn backoff_index_is_clamped() {
        let s = crate::settings::Settings::default();
        let h = harness();
        let actor = Actor::new(h.stub.as_ref(), h.clock.as_ref(), &s.click, &s.recover);
        assert_eq!(actor.backoff(1), millis(100));
        assert_eq!(actor.backoff(3), millis(500));
        assert_eq!(actor.backoff(9), millis(500));
    }
}
