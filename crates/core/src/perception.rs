use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{imageops, GrayImage};
use imageproc::template_matching::{self, MatchTemplateMethod};
use serde::Serialize;
use tracing::{debug, warn};

use crate::action::ClickFallback;
use crate::error::{BackendError, EngineError};
use crate::platform::{Platform, RecognizedText, TextRecognizer};
use crate::scene::{SceneDescriptor, SceneRegistry, TemplateRule};
use crate::settings::FlowSettings;
use crate::clock::Clock;
use crate::types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectMethod {
    Exact,
    FuzzyText,
}

#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub matched: bool,
    pub scene: Option<Arc<SceneDescriptor>>,
    pub confidence: f32,
    pub method: DetectMethod,
    pub elapsed: Duration,
    /// The default rule set stood in for the capture's resolution.
    pub degraded: bool,
}

impl DetectionResult {
    pub fn scene_name(&self) -> Option<&str> {
        self.scene.as_deref().map(|s| s.name.as_str())
    }
}

/// A capture prepared once for every strategy.
pub struct Frame<'a> {
    pub capture: &'a Capture,
    pub gray: GrayImage,
}

impl<'a> Frame<'a> {
    pub fn new(capture: &'a Capture) -> Self {
        Self { capture, gray: imageops::grayscale(&capture.image) }
    }
}

pub struct StrategyHit {
    pub scene: Arc<SceneDescriptor>,
    pub confidence: f32,
    pub degraded: bool,
}

/// One way of recognizing a scene. Strategies run in registration order
/// and the first hit wins.
pub trait DetectStrategy: Send + Sync {
    fn method(&self) -> DetectMethod;

    /// Fallback strategies only run when the caller enables them, and only
    /// ever see exceptional scenes.
    fn is_fallback(&self) -> bool;

    fn detect(&self, frame: &Frame, candidates: &[Arc<SceneDescriptor>]) -> Result<Option<StrategyHit>, BackendError>;
}

/// Zero-mean normalized cross-correlation of `template` over `image`,
/// restricted to `area` when given. Returns the best score and its
/// top-left corner. Flat (zero-variance) windows score 0.
pub fn match_template(image: &GrayImage, template: &GrayImage, area: Option<Rect>) -> Option<(f32, Point)> {
    let full = Rect::new(0, 0, image.width() as i32, image.height() as i32);
    let area = match area {
        Some(a) => a.intersect(&full)?,
        None => full,
    };
    let (tw, th) = template.dimensions();
    if tw == 0 || th == 0 || tw as i32 > area.w || th as i32 > area.h {
        return None;
    }

    let view = imageops::crop_imm(image, area.l as u32, area.t as u32, area.w as u32, area.h as u32).to_image();
    let cross = template_matching::match_template(&view, template, MatchTemplateMethod::CrossCorrelation);

    let n = (tw * th) as f64;
    let t_sum: f64 = template.pixels().map(|p| p.0[0] as f64).sum();
    let t_sq: f64 = template.pixels().map(|p| (p.0[0] as f64).powi(2)).sum();
    let t_var = t_sq - t_sum * t_sum / n;
    let sums = WindowSums::new(&view);

    let mut best: Option<(f32, Point)> = None;
    for (x, y, c) in cross.enumerate_pixels() {
        let (sum, sum_sq) = sums.window(x, y, tw, th);
        let i_var = sum_sq - sum * sum / n;
        let score = if i_var <= f64::EPSILON || t_var <= f64::EPSILON {
            0.0
        } else {
            let centered = c.0[0] as f64 - sum * t_sum / n;
            (centered / (i_var * t_var).sqrt()).clamp(-1.0, 1.0) as f32
        };
        if best.map_or(true, |(s, _)| score > s) {
            best = Some((score, Point::new(area.l + x as i32, area.t + y as i32)));
        }
    }
    best
}

/// Summed-area tables of pixel values and their squares, one row and one
/// column larger than the image.
struct WindowSums {
    stride: usize,
    sum: Vec<u64>,
    sq: Vec<u64>,
}

impl WindowSums {
    fn new(img: &GrayImage) -> Self {
        let stride = img.width() as usize + 1;
        let len = stride * (img.height() as usize + 1);
        let (mut sum, mut sq) = (vec![0u64; len], vec![0u64; len]);
        for (x, y, p) in img.enumerate_pixels() {
            let i = (y as usize + 1) * stride + x as usize + 1;
            let v = p.0[0] as u64;
            sum[i] = v + sum[i - 1] + sum[i - stride] - sum[i - stride - 1];
            sq[i] = v * v + sq[i - 1] + sq[i - stride] - sq[i - stride - 1];
        }
        Self { stride, sum, sq }
    }

    /// Sum and sum of squares of the `w` x `h` window at (`x`, `y`).
    fn window(&self, x: u32, y: u32, w: u32, h: u32) -> (f64, f64) {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        let s = self.stride;
        let area = |t: &[u64]| (t[y1 * s + x1] + t[y0 * s + x0] - t[y0 * s + x1] - t[y1 * s + x0]) as f64;
        (area(&self.sum), area(&self.sq))
    }
}

/// Score of one rule against a frame; `roi` is window-relative and is
/// shifted into the captured region.
fn score_rule(frame: &Frame, rule: &TemplateRule) -> Option<(f32, Point)> {
    let region = frame.capture.region;
    let area = rule.roi.map(|r| r.translate(-region.l, -region.t));
    match_template(&frame.gray, &rule.template, area)
        .map(|(s, p)| (s, p.offset(region.l, region.t)))
}

pub struct ExactTemplateStrategy;

impl DetectStrategy for ExactTemplateStrategy {
    fn method(&self) -> DetectMethod {
        DetectMethod::Exact
    }

    fn is_fallback(&self) -> bool {
        false
    }

    fn detect(&self, frame: &Frame, candidates: &[Arc<SceneDescriptor>]) -> Result<Option<StrategyHit>, BackendError> {
        let res = frame.capture.resolution();
        'scenes: for scene in candidates {
            let (rules, degraded) = scene.rules_for(res);
            if rules.detect.is_empty() {
                continue;
            }
            // every rule must pass; cheapest first so misses exit early
            let mut confidence = 1.0f32;
            for rule in &rules.detect {
                match score_rule(frame, rule) {
                    Some((score, _)) if score >= rule.threshold => confidence = confidence.min(score),
                    _ => continue 'scenes,
                }
            }
            return Ok(Some(StrategyHit { scene: scene.clone(), confidence, degraded }));
        }
        Ok(None)
    }
}

/// Recognizes text in a centered sub-region of the window and matches it
/// against the scenes' text rules.
pub struct TextFallbackStrategy {
    platform: Arc<dyn Platform>,
    recognizer: Arc<dyn TextRecognizer>,
    region_ratio: f32,
    min_confidence: f32,
}

impl TextFallbackStrategy {
    pub fn new(platform: Arc<dyn Platform>, recognizer: Arc<dyn TextRecognizer>, flow: &FlowSettings) -> Self {
        Self {
            platform,
            recognizer,
            region_ratio: flow.ocr_region_ratio,
            min_confidence: flow.ocr_min_confidence,
        }
    }
}

impl DetectStrategy for TextFallbackStrategy {
    fn method(&self) -> DetectMethod {
        DetectMethod::FuzzyText
    }

    fn is_fallback(&self) -> bool {
        true
    }

    fn detect(&self, frame: &Frame, candidates: &[Arc<SceneDescriptor>]) -> Result<Option<StrategyHit>, BackendError> {
        if candidates.iter().all(|s| s.text_rules.is_empty()) {
            return Ok(None);
        }
        let win = frame.capture.window_rect;
        let narrow = Rect::new(0, 0, win.w, win.h).centered(self.region_ratio);
        let cap = self.platform.capture_region(frame.capture.window, Some(narrow))?;
        let texts = self.recognizer.recognize(&cap.image, &[])?;
        debug!(count = texts.len(), "text fallback recognized");

        for scene in candidates {
            for rule in &scene.text_rules {
                let floor = rule.min_confidence.max(self.min_confidence);
                let hit = texts
                    .iter()
                    .filter(|t| t.confidence >= floor && rule.pattern.is_match(&t.text))
                    .map(|t| t.confidence)
                    .fold(None, |best: Option<f32>, c| Some(best.map_or(c, |b| b.max(c))));
                if let Some(confidence) = hit {
                    return Ok(Some(StrategyHit { scene: scene.clone(), confidence, degraded: false }));
                }
            }
        }
        Ok(None)
    }
}

/// Read-only view of the target window: which known scene is showing.
pub struct Perception {
    platform: Arc<dyn Platform>,
    recognizer: Arc<dyn TextRecognizer>,
    registry: Arc<SceneRegistry>,
    clock: Arc<dyn Clock>,
    strategies: Vec<Box<dyn DetectStrategy>>,
    degraded_seen: Mutex<HashSet<(u32, u32)>>,
    clickable: Vec<String>,
}

impl Perception {
    pub fn new(
        platform: Arc<dyn Platform>,
        recognizer: Arc<dyn TextRecognizer>,
        clock: Arc<dyn Clock>,
        registry: Arc<SceneRegistry>,
        flow: &FlowSettings,
    ) -> Self {
        let text = TextFallbackStrategy::new(platform.clone(), recognizer.clone(), flow);
        Self {
            platform,
            recognizer,
            registry,
            clock,
            strategies: vec![Box::new(ExactTemplateStrategy), Box::new(text)],
            degraded_seen: Mutex::new(HashSet::new()),
            clickable: flow.clickable_keywords.clone(),
        }
    }

    /// Append a strategy after the built-in ones.
    pub fn with_strategy(mut self, strategy: Box<dyn DetectStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn registry(&self) -> &SceneRegistry {
        &self.registry
    }

    pub fn capture(&self, window: WindowId) -> Result<Capture, BackendError> {
        self.platform.capture_region(window, None)
    }

    /// Classify `capture` against `candidates`.
    ///
    /// Candidates are tried in registry priority order, so when several
    /// scenes match the first declared one wins. Fallback strategies run only
    /// when `fallback` is set and no exact match exists, and can only resolve
    /// to exceptional scenes. "Not found" is `matched = false`; errors are
    /// reserved for backend failures.
    pub fn classify(
        &self,
        capture: &Capture,
        candidates: &[Arc<SceneDescriptor>],
        fallback: bool,
    ) -> Result<DetectionResult, BackendError> {
        let started = self.clock.now();
        let mut ordered: Vec<Arc<SceneDescriptor>> = candidates.to_vec();
        ordered.sort_by_key(|s| self.registry.priority(&s.name));
        ordered.dedup_by(|a, b| a.name == b.name);
        let exceptional: Vec<Arc<SceneDescriptor>> =
            ordered.iter().filter(|s| s.is_exceptional()).cloned().collect();

        let frame = Frame::new(capture);
        for strategy in &self.strategies {
            let pool = if strategy.is_fallback() {
                if !fallback || exceptional.is_empty() {
                    continue;
                }
                &exceptional
            } else {
                &ordered
            };
            let Some(hit) = strategy.detect(&frame, pool)? else { continue };
            if strategy.is_fallback() && !hit.scene.is_exceptional() {
                warn!(scene = %hit.scene.name, "fallback strategy returned a primary scene, ignored");
                continue;
            }
            if hit.degraded {
                self.note_degraded(capture.resolution());
            }
            let elapsed = self.clock.now().saturating_sub(started);
            debug!(scene = %hit.scene.name, confidence = hit.confidence, method = ?strategy.method(), "classified");
            return Ok(DetectionResult {
                matched: true,
                scene: Some(hit.scene),
                confidence: hit.confidence,
                method: strategy.method(),
                elapsed,
                degraded: hit.degraded,
            });
        }

        Ok(DetectionResult {
            matched: false,
            scene: None,
            confidence: 0.0,
            method: if fallback { DetectMethod::FuzzyText } else { DetectMethod::Exact },
            elapsed: self.clock.now().saturating_sub(started),
            degraded: false,
        })
    }

    fn note_degraded(&self, resolution: (u32, u32)) {
        if self.degraded_seen.lock().unwrap().insert(resolution) {
            warn!(
                width = resolution.0,
                height = resolution.1,
                "no rule set for this resolution, using default templates (degraded match)"
            );
        }
    }

    /// Window-relative rect of a named target: a fixed region when the rule
    /// set declares one, otherwise the matched box of its template.
    pub fn locate(&self, capture: &Capture, scene: &SceneDescriptor, name: &str) -> Option<Rect> {
        let (rules, _) = scene.rules_for(capture.resolution());
        if let Some(rect) = rules.regions.get(name) {
            return Some(*rect);
        }
        let rule = rules.targets.get(name)?;
        let frame = Frame::new(capture);
        match score_rule(&frame, rule) {
            Some((score, at)) if score >= rule.threshold => Some(Rect::new(
                at.x,
                at.y,
                rule.template.width() as i32,
                rule.template.height() as i32,
            )),
            _ => None,
        }
    }

    /// Recognized texts equal (case-insensitive) to one of `keywords`,
    /// with window-relative locations.
    pub fn find_keywords(&self, window: WindowId, keywords: &[String]) -> Result<Vec<RecognizedText>, BackendError> {
        let cap = self.platform.capture_region(window, None)?;
        let texts = self.recognizer.recognize(&cap.image, &[])?;
        Ok(texts
            .into_iter()
            .filter(|t| {
                let text = t.text.trim().to_lowercase();
                keywords.iter().any(|k| k.to_lowercase() == text)
            })
            .map(|t| RecognizedText { location: t.location.translate(cap.region.l, cap.region.t), ..t })
            .collect())
    }
}

/// Click fallback: the most confident clickable keyword on screen.
impl ClickFallback for Perception {
    fn find_target(&self, window: WindowId) -> Result<Option<Rect>, EngineError> {
        let hits = self.find_keywords(window, &self.clickable)?;
        Ok(hits
            .into_iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .map(|t| t.location))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::platform::stub::{StubPlatform, StubScreen};
    use crate::scene::SceneKind;
    use crate::testutil::*;
    use regex::Regex;

    #[test]
    fn ncc_finds_pasted_patch() {
        let mut canvas = noise(60, 40, 1);
        let patch = noise(10, 10, 2);
        paste(&mut canvas, &patch, Point::new(33, 17));
        let (score, at) = match_template(&gray(&canvas), &gray(&patch), None).unwrap();
        assert!(score > 0.99);
        assert_eq!(at, Point::new(33, 17));
    }

    #[test]
    fn ncc_rejects_absent_patch_and_flat_images() {
        let canvas = noise(40, 40, 3);
        let other = noise(10, 10, 4);
        let (score, _) = match_template(&gray(&canvas), &gray(&other), None).unwrap();
        assert!(score < 0.86);

        let flat = GrayImage::new(20, 20);
        let (score, _) = match_template(&flat, &gray(&other), None).unwrap();
        assert_eq!(score, 0.0);
        assert!(match_template(&gray(&other), &flat, None).is_none());
    }

    #[test]
    fn ncc_agrees_with_direct_formula_inside_roi() {
        let canvas = gray(&noise(30, 24, 5));
        let patch = gray(&noise(6, 5, 6));
        let roi = Rect::new(4, 3, 15, 12);
        let (score, at) = match_template(&canvas, &patch, Some(roi)).unwrap();
        assert!(roi.contains(at) && at.x + 6 <= roi.r() && at.y + 5 <= roi.b());

        let direct = |x: i32, y: i32| -> f64 {
            let n = 30.0;
            let t: Vec<f64> = patch.pixels().map(|p| p.0[0] as f64).collect();
            let i: Vec<f64> = (0..5)
                .flat_map(|dy| (0..6).map(move |dx| (dx, dy)))
                .map(|(dx, dy)| canvas.get_pixel((x + dx) as u32, (y + dy) as u32).0[0] as f64)
                .collect();
            let (tm, im) = (t.iter().sum::<f64>() / n, i.iter().sum::<f64>() / n);
            let cross: f64 = t.iter().zip(&i).map(|(a, b)| (a - tm) * (b - im)).sum();
            let tv: f64 = t.iter().map(|a| (a - tm).powi(2)).sum();
            let iv: f64 = i.iter().map(|b| (b - im).powi(2)).sum();
            cross / (tv * iv).sqrt()
        };
        assert!((score as f64 - direct(at.x, at.y)).abs() < 1e-3);
        for y in roi.t..=roi.b() - 5 {
            for x in roi.l..=roi.r() - 6 {
                assert!(direct(x, y) <= score as f64 + 1e-3);
            }
        }
    }

    struct Fixture {
        stub: Arc<StubPlatform>,
        perception: Perception,
        window: WindowId,
    }

    fn fixture(scenes: Vec<SceneDescriptor>, screen: StubScreen) -> Fixture {
        let stub = Arc::new(StubPlatform::new(Rect::new(0, 0, 800, 560)));
        let name = screen.name.clone();
        stub.add_screen(screen);
        let window = stub.open_window("Client", "client", Rect::new(10, 10, 160, 120), &name);
        let registry = Arc::new(SceneRegistry::new(scenes).unwrap());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let perception = Perception::new(stub.clone(), stub.clone(), clock, registry, &FlowSettings::default());
        Fixture { stub, perception, window }
    }

    fn candidates(p: &Perception, names: &[&str]) -> Vec<Arc<SceneDescriptor>> {
        names.iter().map(|n| p.registry().get(n).unwrap()).collect()
    }

    #[test]
    fn ties_go_to_first_declared_scene() {
        let badge = noise(12, 12, 50);
        let rule = || TemplateRule::new("badge", gray(&badge), 0.86).within(BADGE_ROI);
        let scenes = vec![
            SceneDescriptor::new("first", SceneKind::Primary).with_detect(rule()),
            SceneDescriptor::new("second", SceneKind::Primary).with_detect(rule()),
        ];
        let f = fixture(scenes, StubScreen::new("s", screen_with_badge(1, &badge)));
        let cap = f.perception.capture(f.window).unwrap();
        let cands = candidates(&f.perception, &["second", "first"]);
        let r = f.perception.classify(&cap, &cands, false).unwrap();
        assert!(r.matched);
        assert_eq!(r.scene_name(), Some("first"));
        assert_eq!(r.method, DetectMethod::Exact);
        assert!(r.degraded);
        assert!(r.confidence > 0.99);
    }

    #[test]
    fn every_detect_rule_must_pass() {
        let badge = noise(12, 12, 60);
        let absent = noise(8, 8, 61);
        let scenes = vec![SceneDescriptor::new("lobby", SceneKind::Primary)
            .with_detect(TemplateRule::new("badge", gray(&badge), 0.86).within(BADGE_ROI))
            .with_detect(TemplateRule::new("absent", gray(&absent), 0.86).within(Rect::new(60, 60, 30, 30)))];
        let f = fixture(scenes, StubScreen::new("s", screen_with_badge(2, &badge)));
        let cap = f.perception.capture(f.window).unwrap();
        let r = f.perception.classify(&cap, &candidates(&f.perception, &["lobby"]), false).unwrap();
        assert!(!r.matched);
        assert!(r.scene.is_none());
    }

    #[test]
    fn resolution_specific_rules_are_not_degraded() {
        let badge = noise(12, 12, 70);
        let mut rules = crate::scene::RuleSet::default();
        rules.detect.push(TemplateRule::new("badge", gray(&badge), 0.86).within(BADGE_ROI));
        let scenes = vec![SceneDescriptor::new("lobby", SceneKind::Primary).with_resolution((160, 120), rules)];
        let f = fixture(scenes, StubScreen::new("s", screen_with_badge(3, &badge)));
        let cap = f.perception.capture(f.window).unwrap();
        let r = f.perception.classify(&cap, &candidates(&f.perception, &["lobby"]), false).unwrap();
        assert!(r.matched);
        assert!(!r.degraded);
    }

    #[test]
    fn text_fallback_only_reaches_exceptional_scenes() {
        let screen = StubScreen::new("popup", noise(160, 120, 4))
            .text("Welcome back", 0.95, Rect::new(50, 40, 60, 12))
            .text("Server notice", 0.9, Rect::new(50, 60, 60, 12));
        let scenes = vec![
            SceneDescriptor::new("lobby", SceneKind::Primary).with_text(Regex::new("(?i)welcome").unwrap(), 0.5),
            SceneDescriptor::new("notice", SceneKind::Exceptional).with_text(Regex::new("(?i)notice").unwrap(), 0.5),
        ];
        let f = fixture(scenes, screen);
        let cap = f.perception.capture(f.window).unwrap();

        let primary_only = candidates(&f.perception, &["lobby"]);
        let r = f.perception.classify(&cap, &primary_only, true).unwrap();
        assert!(!r.matched);

        let all = candidates(&f.perception, &["lobby", "notice"]);
        let r = f.perception.classify(&cap, &all, true).unwrap();
        assert!(r.matched);
        assert_eq!(r.scene_name(), Some("notice"));
        assert_eq!(r.method, DetectMethod::FuzzyText);

        let r = f.perception.classify(&cap, &all, false).unwrap();
        assert!(!r.matched);
    }

    #[test]
    fn text_fallback_needs_confidence_and_center_region() {
        let screen = StubScreen::new("popup", noise(160, 120, 5))
            .text("Server notice", 0.3, Rect::new(50, 40, 60, 12))
            .text("Notice board", 0.99, Rect::new(2, 2, 40, 10));
        let scenes = vec![SceneDescriptor::new("notice", SceneKind::Exceptional)
            .with_text(Regex::new("(?i)notice").unwrap(), 0.5)];
        let f = fixture(scenes, screen);
        let cap = f.perception.capture(f.window).unwrap();
        let r = f.perception.classify(&cap, &candidates(&f.perception, &["notice"]), true).unwrap();
        assert!(!r.matched);
        assert!(f.stub.inspect(|d| d.clicks.is_empty()));
    }

    #[test]
    fn locate_prefers_regions_then_templates() {
        let ok = noise(10, 8, 80);
        let mut img = noise(160, 120, 6);
        paste(&mut img, &ok, Point::new(90, 70));
        let scenes = vec![SceneDescriptor::new("dialog", SceneKind::Primary)
            .with_region("close", Rect::new(1, 2, 3, 4))
            .with_target("ok", TemplateRule::new("ok", gray(&ok), 0.9).within(Rect::new(80, 60, 40, 40)))];
        let f = fixture(scenes, StubScreen::new("s", img));
        let cap = f.perception.capture(f.window).unwrap();
        let scene = f.perception.registry().get("dialog").unwrap();
        assert_eq!(f.perception.locate(&cap, &scene, "close"), Some(Rect::new(1, 2, 3, 4)));
        assert_eq!(f.perception.locate(&cap, &scene, "ok"), Some(Rect::new(90, 70, 10, 8)));
        assert_eq!(f.perception.locate(&cap, &scene, "missing"), None);
    }

    #[test]
    fn keywords_match_whole_text() {
        let screen = StubScreen::new("popup", noise(160, 120, 7))
            .text("OK", 0.9, Rect::new(70, 80, 20, 10))
            .text("Book", 0.9, Rect::new(10, 10, 20, 10));
        let f = fixture(vec![], screen);
        let found = f.perception.find_keywords(f.window, &["ok".to_string()]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].location, Rect::new(70, 80, 20, 10));
    }
}
