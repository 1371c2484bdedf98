use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame,
};
use rota_core::logger::{COLOR_BLUE, COLOR_GRAY};
use rota_core::monitor::{AccountView, MonitorView};
use rota_core::state::CycleStatus;
use rota_core::types::AccountOutcome;

use crate::App;

pub fn draw(f: &mut Frame, app: &App) {
    let view = app.view();
    let constraints: &[Constraint] = if app.log_visible {
        &[Constraint::Percentage(55), Constraint::Percentage(45)]
    } else {
        &[Constraint::Percentage(100)]
    };
    let chunks = Layout::default().direction(Direction::Horizontal).constraints(constraints).split(f.area());

    let left = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1), Constraint::Min(0)])
        .split(chunks[0]);
    let (label, bg) = banner(&view, app.stop.is_set(), app.worker_running());
    draw_banner(f, left[0], &label, bg);

    let panel = Paragraph::new(account_lines(&view, app.selected, bg)).block(
        Block::default()
            .borders(Borders::LEFT | Borders::RIGHT | Borders::BOTTOM)
            .border_style(Style::default().fg(Color::Cyan)),
    );
    f.render_widget(panel, left[1]);

    if app.log_visible {
        draw_logs(f, chunks[1], app);
    }
    if let Some(dialog) = &app.confirm {
        dialog.render(f);
    }
}

fn banner(view: &MonitorView, stop_set: bool, running: bool) -> (String, Color) {
    if stop_set && running {
        return ("STOP REQUESTED (halting at next account)".into(), Color::Yellow);
    }
    match view.status {
        Some(CycleStatus::Running) if running => {
            (format!("RUNNING {}/{} (s to stop)", (view.next_index + 1).min(view.total), view.total), Color::Green)
        }
        Some(CycleStatus::Manual) => ("MANUAL INTERVENTION REQUIRED".into(), Color::Magenta),
        Some(CycleStatus::Stopped) => ("STOPPED (c to clear stop flag)".into(), Color::Red),
        Some(CycleStatus::Completed) => ("COMPLETED".into(), Color::Cyan),
        _ if running => ("WAITING FOR TRIGGER".into(), Color::Blue),
        _ => ("IDLE".into(), Color::DarkGray),
    }
}

fn draw_banner(f: &mut Frame, area: Rect, label: &str, bg: Color) {
    let width = area.width as usize;
    let centered = format!("{:^width$}", label, width = width.max(label.len()));
    let style = Style::default().fg(Color::Black).bg(bg).add_modifier(Modifier::BOLD);
    f.render_widget(Paragraph::new(Span::styled(centered, style)), area);
}

fn key(k: &'static str) -> Span<'static> {
    Span::styled(k, Style::default().fg(Color::Yellow))
}

fn account_lines(view: &MonitorView, selected: usize, accent: Color) -> Vec<Line<'static>> {
    let dim = Style::default().fg(Color::DarkGray);
    let mut lines = vec![
        Line::from(vec![
            Span::raw(" "),
            key("s"),
            Span::raw(" stop, "),
            key("c"),
            Span::raw(" clear stop, "),
            key("l"),
            Span::raw(" logs, "),
            key("q"),
            Span::raw(" quit"),
        ]),
        Line::from(""),
    ];
    if !view.cycle_id.is_empty() {
        lines.push(Line::from(vec![
            Span::styled(" cycle ", dim),
            Span::styled(view.cycle_id.clone(), Style::default().fg(Color::White)),
            Span::styled(format!("  next {}/{}", view.next_index, view.total), dim),
        ]));
    }
    if let Some((at, label)) = &view.last_trigger {
        lines.push(Line::from(vec![
            Span::styled(format!(" last trigger {} ", at.format("%m-%d %H:%M")), dim),
            Span::styled(label.clone(), Style::default().fg(Color::White)),
        ]));
    }
    lines.push(Line::from(""));

    for (i, acc) in view.accounts.iter().enumerate() {
        let cursor = if i == selected { "> " } else { "  " };
        let marker = if acc.active { "[*]" } else { "[ ]" };
        let mut spans = vec![
            Span::raw(cursor),
            Span::styled(marker, Style::default().fg(accent)),
            Span::raw(" "),
            Span::styled(acc.id.clone(), Style::default().fg(Color::White).add_modifier(Modifier::BOLD)),
        ];
        spans.extend(outcome_spans(acc));
        lines.push(Line::from(spans));
    }
    lines
}

fn outcome_spans(acc: &AccountView) -> Vec<Span<'static>> {
    let mut spans = Vec::new();
    match &acc.outcome {
        None if acc.active => spans.push(Span::styled("  running", Style::default().fg(Color::Cyan))),
        None => {}
        Some(AccountOutcome::Succeeded) => spans.push(Span::styled("  ok", Style::default().fg(Color::Green))),
        Some(AccountOutcome::Failed(r)) => spans.push(Span::styled(format!("  failed: {}", r), Style::default().fg(Color::Red))),
        Some(AccountOutcome::Manual(r)) => {
            spans.push(Span::styled(format!("  manual: {}", r), Style::default().fg(Color::Magenta)))
        }
    }
    if acc.retries > 0 {
        spans.push(Span::styled(format!(" (retries {})", acc.retries), Style::default().fg(Color::DarkGray)));
    }
    spans
}

fn draw_logs(f: &mut Frame, area: Rect, app: &App) {
    let height = area.height.saturating_sub(2) as usize;
    let total = app.log_messages.len();
    let scroll = app.log_scroll.min(total.saturating_sub(height));
    let end = total - scroll;
    let start = end.saturating_sub(height);
    let lines: Vec<Line> = app.log_messages[start..end].iter().map(|m| parse_log_line(m)).collect();

    let title = if scroll > 0 { format!(" Logs (+{}) ", scroll) } else { " Logs ".to_string() };
    let panel = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title(title).border_style(Style::default().fg(Color::Yellow)))
        .wrap(Wrap { trim: false });
    f.render_widget(panel, area);
}

/// Render one forwarded log record (`level\x1fprefix\x1fcolor\x1fts\x1fmsg`).
/// Anything else is shown verbatim.
pub fn parse_log_line(raw: &str) -> Line<'_> {
    let parts: Vec<&str> = raw.splitn(5, '\x1f').collect();
    let [level, prefix, color, ts, msg] = parts[..] else {
        return Line::from(raw);
    };
    let tint = match color.parse::<u8>() {
        Ok(COLOR_GRAY) => Color::DarkGray,
        Ok(COLOR_BLUE) => Color::LightBlue,
        _ => Color::White,
    };

    let mut spans = vec![Span::styled(ts, Style::default().fg(Color::DarkGray)), Span::raw(" ")];
    match level {
        "ERROR" => spans.push(Span::styled("error ", Style::default().fg(Color::Red))),
        "WARN" => spans.push(Span::styled("warn ", Style::default().fg(Color::Yellow))),
        "DEBUG" | "TRACE" => spans.push(Span::styled("debug ", Style::default().fg(Color::DarkGray))),
        _ => {}
    }
    if !prefix.is_empty() {
        spans.push(Span::styled(prefix, Style::default().fg(tint).add_modifier(Modifier::BOLD)));
        spans.push(Span::raw(" "));
    }
    spans.push(Span::styled(msg, Style::default().fg(tint)));
    Line::from(spans)
}
