use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::{mpsc, Mutex, OnceLock};

use anyhow::{Context as _, Result};
use chrono::Local;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

// Color indices for TUI rendering (mapped in ui.rs)
pub const COLOR_DEFAULT: u8 = 0;
pub const COLOR_GRAY: u8 = 1;
pub const COLOR_BLUE: u8 = 2;

static INIT: OnceLock<()> = OnceLock::new();
static TUI_TX: Mutex<Option<mpsc::Sender<String>>> = Mutex::new(None);

/// Install the global subscriber: `RUST_LOG` filter (default `info`),
/// `<log_dir>/app.log` (cleared on start) and the TUI forwarder.
/// Later calls do nothing.
pub fn init(log_dir: &Path) -> Result<()> {
    let mut result = Ok(());
    INIT.get_or_init(|| result = install(log_dir));
    result
}

fn install(log_dir: &Path) -> Result<()> {
    fs::create_dir_all(log_dir).with_context(|| format!("creating {}", log_dir.display()))?;
    let log_path = log_dir.join("app.log");
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)
        .with_context(|| format!("opening {}", log_path.display()))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = fmt::layer().with_writer(Mutex::new(file)).with_ansi(false).with_target(true);
    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(TuiLayer)
        .try_init()
        .context("installing log subscriber")
}

/// Wire the TUI log channel.
pub fn set_tui_sender(tx: mpsc::Sender<String>) {
    *TUI_TX.lock().unwrap() = Some(tx);
}

/// Last path segment of a tracing target: `rota_core::machine` -> `machine`.
pub fn prefix_of(target: &str) -> &str {
    target.rsplit("::").next().unwrap_or(target)
}

pub fn color_for(prefix: &str) -> u8 {
    match prefix {
        "stub" => COLOR_GRAY,
        "orchestrator" | "scheduler" => COLOR_BLUE,
        _ => COLOR_DEFAULT,
    }
}

/// TUI wire format, `\x1f`-separated:
/// level, prefix, color, timestamp, message.
pub fn format_tui_line(level: &Level, target: &str, ts: &str, msg: &str) -> String {
    let prefix = prefix_of(target);
    format!("{}\x1f{}\x1f{}\x1f{}\x1f{}", level, prefix, color_for(prefix), ts, msg)
}

struct TuiLayer;

impl<S: Subscriber> Layer<S> for TuiLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let tx = TUI_TX.lock().unwrap();
        let Some(tx) = tx.as_ref() else { return };
        let mut v = MessageVisitor::default();
        event.record(&mut v);
        let meta = event.metadata();
        let ts = Local::now().format("%H:%M:%S").to_string();
        tx.send(format_tui_line(meta.level(), meta.target(), &ts, &v.finish())).ok();
    }
}

/// Flattens an event into `message key=value ...`.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        self.message + &self.fields
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            write!(self.fields, " {}={}", field.name(), value).ok();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            write!(self.message, "{:?}", value).ok();
        } else {
            write!(self.fields, " {}={:?}", field.name(), value).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tui_line_layout() {
        let line = format_tui_line(&Level::WARN, "rota_core::orchestrator", "09:15:02", "account failed");
        let parts: Vec<&str> = line.split('\x1f').collect();
        assert_eq!(parts, vec!["WARN", "orchestrator", "2", "09:15:02", "account failed"]);
        assert_eq!(prefix_of("rota_core::platform::stub"), "stub");
        assert_eq!(color_for("stub"), COLOR_GRAY);
        assert_eq!(color_for("machine"), COLOR_DEFAULT);
        assert_eq!(prefix_of("main"), "main");
    }

    #[test]
    fn events_are_forwarded_with_fields() {
        let (tx, rx) = mpsc::channel();
        set_tui_sender(tx);
        let subscriber = tracing_subscriber::registry().with(TuiLayer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "rota_core::scheduler", at = "09:00", "forwarded-event");
        });
        let line = rx.try_iter().find(|l| l.contains("forwarded-event")).unwrap();
        let parts: Vec<&str> = line.split('\x1f').collect();
        assert_eq!(parts[0], "INFO");
        assert_eq!(parts[1], "scheduler");
        assert_eq!(parts[2], "2");
        assert_eq!(parts[4], "forwarded-event at=09:00");
    }

    #[test]
    fn init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        init(dir.path()).unwrap();
        assert!(dir.path().join("app.log").exists());
        init(&dir.path().join("other")).unwrap();
        assert!(!dir.path().join("other").exists());
    }
}
