use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{info, warn};

use crate::platform::{EvidenceSink, FailureReport};

/// Writes one directory per failure under `dir`.
pub struct FileEvidenceSink {
    dir: PathBuf,
}

impl FileEvidenceSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn bundle_dir(&self, tag: &str) -> PathBuf {
        let tag: String = tag
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let stamp = Local::now().format("%Y%m%d_%H%M%S_%3f");
        let base = self.dir.join(format!("{}_{}", if tag.is_empty() { "failure" } else { &tag }, stamp));
        let mut path = base.clone();
        let mut n = 1;
        while path.exists() {
            path = PathBuf::from(format!("{}_{}", base.display(), n));
            n += 1;
        }
        path
    }

    fn write(&self, report: &FailureReport) -> io::Result<PathBuf> {
        let dir = self.bundle_dir(&report.tag);
        fs::create_dir_all(&dir)?;
        let context = serde_json::to_string_pretty(report)?;
        fs::write(dir.join("context.json"), context)?;

        let mut error = report.reason.clone();
        if let Some(stack) = &report.stack_info {
            error.push('\n');
            error.push_str(stack);
        }
        fs::write(dir.join("error.txt"), error)?;

        if let Some(html) = &report.html {
            fs::write(dir.join("page.html"), html)?;
        }
        if let Some(img) = &report.screenshot {
            save_png(img, &dir.join("screenshot.png"))?;
        }
        Ok(dir)
    }
}

fn save_png(img: &image::RgbaImage, path: &Path) -> io::Result<()> {
    img.save_with_format(path, image::ImageFormat::Png)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

impl EvidenceSink for FileEvidenceSink {
    fn record_failure(&self, report: &FailureReport) {
        match self.write(report) {
            Ok(dir) => info!(path = %dir.display(), stage = %report.stage, "evidence saved"),
            Err(e) => warn!(dir = %self.dir.display(), error = %e, "failed to save evidence"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ClickAttemptResult;
    use crate::testutil::noise;
    use image::GenericImageView;

    #[test]
    fn writes_a_complete_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileEvidenceSink::new(dir.path().join("evidence"));
        let report = FailureReport {
            tag: "lobby/start".into(),
            stage: "lobby".into(),
            reason: "click_rounds_exhausted".into(),
            account: Some("amy".into()),
            window: Some("Client".into()),
            attempts: vec![ClickAttemptResult {
                success: false,
                point: None,
                round: 1,
                offset_index: Some(0),
                reason: "verify_failed".into(),
            }],
            stack_info: Some("lobby: click_rounds_exhausted".into()),
            screenshot: Some(noise(8, 6, 1)),
            html: Some("<html></html>".into()),
        };
        sink.record_failure(&report);
        sink.record_failure(&report);

        let bundles: Vec<PathBuf> =
            fs::read_dir(dir.path().join("evidence")).unwrap().map(|e| e.unwrap().path()).collect();
        assert_eq!(bundles.len(), 2);
        let b = &bundles[0];
        assert!(b.file_name().unwrap().to_string_lossy().starts_with("lobby_start_"));
        let ctx: serde_json::Value = serde_json::from_str(&fs::read_to_string(b.join("context.json")).unwrap()).unwrap();
        assert_eq!(ctx["account"], "amy");
        assert_eq!(ctx["attempts"][0]["offset_index"], 0);
        assert!(fs::read_to_string(b.join("error.txt")).unwrap().starts_with("click_rounds_exhausted"));
        assert!(b.join("page.html").exists());
        let png = image::open(b.join("screenshot.png")).unwrap();
        assert_eq!(png.dimensions(), (8, 6));
    }

    #[test]
    fn unwritable_target_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();
        let sink = FileEvidenceSink::new(blocker.join("evidence"));
        sink.record_failure(&FailureReport { tag: "x".into(), ..Default::default() });
    }
}
