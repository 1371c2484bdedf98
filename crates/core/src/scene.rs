use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use image::GrayImage;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::types::Rect;

pub const DEFAULT_THRESHOLD: f32 = 0.86;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneKind {
    /// Part of the normal workflow.
    Primary,
    /// Error, popup or transient state.
    Exceptional,
}

/// Exact-match rule: a template that must appear somewhere inside `roi`.
#[derive(Debug, Clone)]
pub struct TemplateRule {
    pub name: String,
    pub template: GrayImage,
    pub threshold: f32,
    /// Search area relative to the window. Whole window when `None`.
    pub roi: Option<Rect>,
}

impl TemplateRule {
    pub fn new(name: impl Into<String>, template: GrayImage, threshold: f32) -> Self {
        Self { name: name.into(), template, threshold, roi: None }
    }

    pub fn within(mut self, roi: Rect) -> Self {
        self.roi = Some(roi);
        self
    }

    /// Pixel count, used to try cheap rules first.
    pub fn cost(&self) -> u64 {
        self.template.width() as u64 * self.template.height() as u64
    }
}

#[derive(Debug, Clone)]
pub struct TextRule {
    pub pattern: Regex,
    pub min_confidence: f32,
}

/// Detection rules and named regions for one resolution.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub detect: Vec<TemplateRule>,
    pub targets: HashMap<String, TemplateRule>,
    pub regions: HashMap<String, Rect>,
}

impl RuleSet {
    fn sort_detect(&mut self) {
        self.detect.sort_by_key(|r| r.cost());
    }
}

/// A recognizable on-screen state. Immutable once registered.
#[derive(Debug, Clone)]
pub struct SceneDescriptor {
    pub name: String,
    pub kind: SceneKind,
    default_rules: RuleSet,
    by_resolution: HashMap<(u32, u32), RuleSet>,
    pub text_rules: Vec<TextRule>,
}

impl SceneDescriptor {
    pub fn new(name: impl Into<String>, kind: SceneKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default_rules: RuleSet::default(),
            by_resolution: HashMap::new(),
            text_rules: Vec::new(),
        }
    }

    pub fn with_detect(mut self, rule: TemplateRule) -> Self {
        self.default_rules.detect.push(rule);
        self.default_rules.sort_detect();
        self
    }

    pub fn with_target(mut self, name: impl Into<String>, rule: TemplateRule) -> Self {
        self.default_rules.targets.insert(name.into(), rule);
        self
    }

    pub fn with_region(mut self, name: impl Into<String>, rect: Rect) -> Self {
        self.default_rules.regions.insert(name.into(), rect);
        self
    }

    pub fn with_text(mut self, pattern: Regex, min_confidence: f32) -> Self {
        self.text_rules.push(TextRule { pattern, min_confidence });
        self
    }

    pub fn with_resolution(mut self, resolution: (u32, u32), mut rules: RuleSet) -> Self {
        rules.sort_detect();
        self.by_resolution.insert(resolution, rules);
        self
    }

    pub fn is_exceptional(&self) -> bool {
        self.kind == SceneKind::Exceptional
    }

    /// Rule set for `resolution`. The flag is true when the default set
    /// stands in for a missing resolution-specific one.
    pub fn rules_for(&self, resolution: (u32, u32)) -> (&RuleSet, bool) {
        match self.by_resolution.get(&resolution) {
            Some(rules) => (rules, false),
            None => (&self.default_rules, true),
        }
    }
}

/// Process-wide, read-only set of scenes in priority order.
#[derive(Debug, Default)]
pub struct SceneRegistry {
    scenes: Vec<Arc<SceneDescriptor>>,
}

impl SceneRegistry {
    pub fn new(scenes: Vec<SceneDescriptor>) -> Result<Self, EngineError> {
        let mut seen = std::collections::HashSet::new();
        for s in &scenes {
            if !seen.insert(s.name.clone()) {
                return Err(EngineError::Config(format!("duplicate scene '{}'", s.name)));
            }
        }
        Ok(Self { scenes: scenes.into_iter().map(Arc::new).collect() })
    }

    pub fn get(&self, name: &str) -> Option<Arc<SceneDescriptor>> {
        self.scenes.iter().find(|s| s.name == name).cloned()
    }

    /// Declaration index; lower wins ties.
    pub fn priority(&self, name: &str) -> usize {
        self.scenes.iter().position(|s| s.name == name).unwrap_or(usize::MAX)
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SceneDescriptor>> {
        self.scenes.iter()
    }

    /// Load `scenes.json` and its templates from an anchors directory.
    ///
    /// Each `<W>x<H>` subdirectory holding every template of a scene becomes
    /// that scene's rule set for the resolution; `regions.json` in the same
    /// subdirectory overrides named regions.
    pub fn load(dir: &Path) -> Result<Self, EngineError> {
        let manifest_path = dir.join("scenes.json");
        let raw = fs::read_to_string(&manifest_path)
            .map_err(|e| EngineError::Config(format!("{}: {}", manifest_path.display(), e)))?;
        let manifest: Manifest = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("{}: {}", manifest_path.display(), e)))?;

        let resolutions = resolution_dirs(dir);
        let mut scenes = Vec::with_capacity(manifest.scenes.len());
        for spec in &manifest.scenes {
            let mut scene = SceneDescriptor::new(&spec.name, spec.kind);
            scene.default_rules = spec.rule_set(dir, HashMap::new())?;
            for (res, sub) in &resolutions {
                if !spec.templates().all(|t| sub.join(t).is_file()) {
                    continue;
                }
                let regions = load_regions(&sub.join("regions.json"), &spec.name)?;
                scene.by_resolution.insert(*res, spec.rule_set(sub, regions)?);
            }
            for t in &spec.text {
                let pattern = Regex::new(&t.pattern)
                    .map_err(|e| EngineError::Config(format!("scene '{}': {}", spec.name, e)))?;
                scene.text_rules.push(TextRule { pattern, min_confidence: t.min_confidence });
            }
            scenes.push(scene);
        }
        info!(scenes = scenes.len(), resolutions = resolutions.len(), "scene registry loaded");
        Self::new(scenes)
    }
}

#[derive(Deserialize)]
struct Manifest {
    scenes: Vec<SceneSpec>,
}

#[derive(Deserialize)]
struct SceneSpec {
    name: String,
    #[serde(default = "primary")]
    kind: SceneKind,
    #[serde(default)]
    detect: Vec<TemplateSpec>,
    #[serde(default)]
    targets: HashMap<String, TemplateSpec>,
    #[serde(default)]
    regions: HashMap<String, Rect>,
    #[serde(default)]
    text: Vec<TextSpec>,
}

#[derive(Deserialize)]
struct TemplateSpec {
    template: String,
    #[serde(default = "default_threshold")]
    threshold: f32,
    #[serde(default)]
    roi: Option<Rect>,
}

#[derive(Deserialize)]
struct TextSpec {
    pattern: String,
    #[serde(default = "default_text_confidence")]
    min_confidence: f32,
}

fn primary() -> SceneKind {
    SceneKind::Primary
}

fn default_threshold() -> f32 {
    DEFAULT_THRESHOLD
}

fn default_text_confidence() -> f32 {
    0.5
}

impl SceneSpec {
    fn templates(&self) -> impl Iterator<Item = &str> {
        self.detect.iter().chain(self.targets.values()).map(|t| t.template.as_str())
    }

    fn rule_set(&self, dir: &Path, overrides: HashMap<String, Rect>) -> Result<RuleSet, EngineError> {
        let mut rules = RuleSet::default();
        for t in &self.detect {
            rules.detect.push(t.load(dir)?);
        }
        for (name, t) in &self.targets {
            rules.targets.insert(name.clone(), t.load(dir)?);
        }
        rules.regions = self.regions.clone();
        rules.regions.extend(overrides);
        rules.sort_detect();
        Ok(rules)
    }
}

impl TemplateSpec {
    fn load(&self, dir: &Path) -> Result<TemplateRule, EngineError> {
        let path = dir.join(&self.template);
        let img = image::open(&path)
            .map_err(|e| EngineError::Config(format!("template {}: {}", path.display(), e)))?;
        Ok(TemplateRule {
            name: self.template.clone(),
            template: img.to_luma8(),
            threshold: self.threshold,
            roi: self.roi,
        })
    }
}

fn resolution_dirs(dir: &Path) -> Vec<((u32, u32), std::path::PathBuf)> {
    let Ok(entries) = fs::read_dir(dir) else { return Vec::new() };
    let mut found: Vec<_> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            parse_resolution(&name).map(|res| (res, e.path()))
        })
        .collect();
    found.sort_by_key(|(res, _)| *res);
    found
}

/// `"1920x1080"` -> `(1920, 1080)`
pub fn parse_resolution(name: &str) -> Option<(u32, u32)> {
    let (w, h) = name.split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

fn load_regions(path: &Path, scene: &str) -> Result<HashMap<String, Rect>, EngineError> {
    if !path.is_file() {
        return Ok(HashMap::new());
    }
    let raw = fs::read_to_string(path).map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
    let mut all: HashMap<String, HashMap<String, Rect>> = serde_json::from_str(&raw)
        .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
    match all.remove(scene) {
        Some(r) => Ok(r),
        None => {
            warn!(scene, path = %path.display(), "no region overrides for scene");
            Ok(HashMap::new())
        }
    }
}
