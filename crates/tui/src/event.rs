use std::io;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind, MouseEventKind};
use ratatui::{backend::CrosstermBackend, Terminal};

use crate::ui;
use crate::App;

pub fn run(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>, app: &mut App) -> anyhow::Result<()> {
    while !app.should_quit {
        app.drain_logs();
        terminal.draw(|f| ui::draw(f, app))?;

        // 100ms poll keeps the monitor fresh while the worker runs
        if !event::poll(Duration::from_millis(100))? {
            continue;
        }
        match event::read()? {
            Event::Key(key) if key.kind == KeyEventKind::Press => handle_key(app, key.code),
            Event::Mouse(mouse) => match mouse.kind {
                MouseEventKind::ScrollUp => app.scroll_log_up(3),
                MouseEventKind::ScrollDown => app.scroll_log_down(3),
                _ => {}
            },
            _ => {}
        }
    }
    Ok(())
}

pub fn handle_key(app: &mut App, code: KeyCode) {
    if let Some(dialog) = app.confirm.as_mut() {
        if let Some(yes) = dialog.handle_key(code) {
            app.answer_confirm(yes);
        }
        return;
    }
    match code {
        KeyCode::Char('q') | KeyCode::Char('Q') => app.quit(),
        KeyCode::Up | KeyCode::Char('k') | KeyCode::Char('K') => app.move_up(),
        KeyCode::Down | KeyCode::Char('j') | KeyCode::Char('J') => app.move_down(),
        KeyCode::Char('s') | KeyCode::Char('S') => app.request_stop(),
        KeyCode::Char('c') | KeyCode::Char('C') => app.clear_stop(),
        KeyCode::Char('l') | KeyCode::Char('L') => app.toggle_log(),
        KeyCode::PageUp => app.scroll_log_up(10),
        KeyCode::PageDown => app.scroll_log_down(10),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rota_core::monitor::Monitor;
    use rota_core::state::StopSignal;
    use std::sync::atomic::AtomicBool;
    use std::sync::{mpsc, Arc};

    #[test]
    fn dialog_swallows_keys_until_answered() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = mpsc::channel();
        let mut app = App::new(Monitor::new(), StopSignal::new(dir.path().join("stop.flag")), Arc::new(AtomicBool::new(false)), rx);

        handle_key(&mut app, KeyCode::Char('q'));
        assert!(app.confirm.is_some());
        // 'l' toggles the dialog choice, not the log panel
        handle_key(&mut app, KeyCode::Char('l'));
        assert!(app.log_visible);
        handle_key(&mut app, KeyCode::Enter);
        assert!(app.should_quit);
        assert!(app.stop.is_set());
    }

    #[test]
    fn stop_and_clear_keys_drive_the_flag() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = mpsc::channel();
        let mut app = App::new(Monitor::new(), StopSignal::new(dir.path().join("stop.flag")), Arc::new(AtomicBool::new(false)), rx);
        handle_key(&mut app, KeyCode::Char('s'));
        assert!(app.stop.is_set());
        handle_key(&mut app, KeyCode::Char('c'));
        assert!(!app.stop.is_set());
    }
}
