use crossterm::event::KeyCode;
use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph},
    Frame,
};

/// Modal yes/no prompt. Defaults to No.
pub struct ConfirmDialog {
    pub message: String,
    pub yes: bool,
}

impl ConfirmDialog {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), yes: false }
    }

    /// `Some(answer)` once the operator has decided.
    pub fn handle_key(&mut self, code: KeyCode) -> Option<bool> {
        match code {
            KeyCode::Left | KeyCode::Right | KeyCode::Tab | KeyCode::Char('h') | KeyCode::Char('l') => {
                self.yes = !self.yes;
                None
            }
            KeyCode::Enter => Some(self.yes),
            KeyCode::Char('y') | KeyCode::Char('Y') => Some(true),
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => Some(false),
            _ => None,
        }
    }

    pub fn render(&self, f: &mut Frame) {
        let width = (self.message.chars().count() as u16 + 6).max(30);
        let area = centered_rect(width, 7, f.area());
        f.render_widget(Clear, area);

        let block = Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Yellow))
            .title(" Confirm ");
        let inner = block.inner(area);
        f.render_widget(block, area);

        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(1), Constraint::Length(1), Constraint::Length(1), Constraint::Length(1)])
            .split(inner);

        let msg = Paragraph::new(Span::styled(self.message.as_str(), Style::default().fg(Color::White)))
            .alignment(Alignment::Center);
        f.render_widget(msg, rows[1]);

        let on = |bg| Style::default().fg(Color::Black).bg(bg).add_modifier(Modifier::BOLD);
        let off = Style::default().fg(Color::DarkGray);
        let buttons = Line::from(vec![
            Span::styled("  [Yes]  ", if self.yes { on(Color::Green) } else { off }),
            Span::raw("   "),
            Span::styled("  [No]  ", if self.yes { off } else { on(Color::Red) }),
        ]);
        f.render_widget(Paragraph::new(buttons).alignment(Alignment::Center), rows[3]);
    }
}

/// A `width` x `height` rect centered in `area`, clipped to it.
fn centered_rect(width: u16, height: u16, area: Rect) -> Rect {
    let x = area.x + area.width.saturating_sub(width) / 2;
    let y = area.y + area.height.saturating_sub(height) / 2;
    Rect::new(x, y, width.min(area.width), height.min(area.height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_answers_current_choice() {
        let mut d = ConfirmDialog::new("quit?");
        assert_eq!(d.handle_key(KeyCode::Enter), Some(false));
        assert_eq!(d.handle_key(KeyCode::Tab), None);
        assert_eq!(d.handle_key(KeyCode::Enter), Some(true));
        assert_eq!(d.handle_key(KeyCode::Esc), Some(false));
        assert_eq!(d.handle_key(KeyCode::Char('x')), None);
    }

    #[test]
    fn dialog_fits_small_screens() {
        let r = centered_rect(40, 7, Rect::new(0, 0, 20, 5));
        assert_eq!((r.width, r.height), (20, 5));
        let r = centered_rect(30, 7, Rect::new(0, 0, 100, 40));
        assert_eq!((r.x, r.y), (35, 16));
    }
}
