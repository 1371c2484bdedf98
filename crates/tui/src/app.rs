use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use rota_core::monitor::{Monitor, MonitorView};
use rota_core::state::StopSignal;
use tracing::warn;

use crate::confirm::ConfirmDialog;

pub struct App {
    pub monitor: Monitor,
    pub stop: StopSignal,
    /// Set by the worker thread once its command has returned.
    pub worker_done: Arc<AtomicBool>,
    pub selected: usize,
    pub log_visible: bool,
    pub log_messages: Vec<String>,
    pub log_scroll: usize, // lines up from the bottom, 0 = follow
    pub log_rx: mpsc::Receiver<String>,
    pub confirm: Option<ConfirmDialog>,
    pub should_quit: bool,
}

impl App {
    pub fn new(monitor: Monitor, stop: StopSignal, worker_done: Arc<AtomicBool>, log_rx: mpsc::Receiver<String>) -> Self {
        Self {
            monitor,
            stop,
            worker_done,
            selected: 0,
            log_visible: true,
            log_messages: Vec::new(),
            log_scroll: 0,
            log_rx,
            confirm: None,
            should_quit: false,
        }
    }

    pub fn view(&self) -> MonitorView {
        self.monitor.snapshot()
    }

    pub fn worker_running(&self) -> bool {
        !self.worker_done.load(Ordering::SeqCst)
    }

    pub fn drain_logs(&mut self) {
        let before = self.log_messages.len();
        self.log_messages.extend(self.log_rx.try_iter());
        // keep the viewport still while the operator is scrolled back
        if self.log_scroll > 0 {
            self.log_scroll += self.log_messages.len() - before;
        }
    }

    pub fn scroll_log_up(&mut self, n: usize) {
        self.log_scroll = self.log_scroll.saturating_add(n);
    }

    pub fn scroll_log_down(&mut self, n: usize) {
        self.log_scroll = self.log_scroll.saturating_sub(n);
    }

    pub fn move_up(&mut self) {
        self.selected = self.selected.saturating_sub(1);
    }

    pub fn move_down(&mut self) {
        let len = self.monitor.snapshot().accounts.len();
        if self.selected + 1 < len {
            self.selected += 1;
        }
    }

    pub fn toggle_log(&mut self) {
        self.log_visible = !self.log_visible;
    }

    pub fn request_stop(&mut self) {
        if let Err(e) = self.stop.request() {
            warn!(error = %e, "could not raise stop flag");
        }
    }

    pub fn clear_stop(&mut self) {
        if let Err(e) = self.stop.clear() {
            warn!(error = %e, "could not clear stop flag");
        }
    }

    /// Quit straight away when idle; otherwise ask before stopping the worker.
    pub fn quit(&mut self) {
        if self.worker_running() {
            self.confirm = Some(ConfirmDialog::new("Stop after this account and quit?"));
        } else {
            self.should_quit = true;
        }
    }

    /// Close the dialog, acting on its answer.
    pub fn answer_confirm(&mut self, yes: bool) {
        if self.confirm.take().is_some() && yes {
            self.request_stop();
            self.should_quit = true;
        }
    }
}
