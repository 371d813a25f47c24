//! Crossterm event translation.

use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

/// What the client should do with one terminal event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send(String),
    ToggleFullscreen,
    Quit,
    Ignore,
}

pub fn translate(event: &Event) -> Action {
    match event {
        Event::Key(key) if key.kind != KeyEventKind::Release => translate_key(key),
        Event::Paste(text) if !text.is_empty() => Action::Send(text.clone()),
        _ => Action::Ignore,
    }
}

fn translate_key(key: &KeyEvent) -> Action {
    match (key.code, key.modifiers) {
        (KeyCode::Char('q'), KeyModifiers::CONTROL) => Action::Quit,
        (KeyCode::F(11), _) => Action::ToggleFullscreen,
        _ => key_sequence(key).map_or(Action::Ignore, Action::Send),
    }
}

/// Raw bytes a terminal would emit for this key.
fn key_sequence(key: &KeyEvent) -> Option<String> {
    let seq = match key.code {
        KeyCode::Char(c) => {
            if key.modifiers.contains(KeyModifiers::CONTROL) && c.is_ascii_alphabetic() {
                // Ctrl+A through Ctrl+Z
                let ctrl = (c.to_ascii_lowercase() as u8) - b'a' + 1;
                return Some(char::from(ctrl).to_string());
            }
            return Some(c.to_string());
        }
        KeyCode::Enter => "\r",
        KeyCode::Backspace => "\x7f",
        KeyCode::Tab => "\t",
        KeyCode::Esc => "\x1b",
        KeyCode::Up => "\x1b[A",
        KeyCode::Down => "\x1b[B",
        KeyCode::Right => "\x1b[C",
        KeyCode::Left => "\x1b[D",
        KeyCode::Home => "\x1b[H",
        KeyCode::End => "\x1b[F",
        KeyCode::PageUp => "\x1b[5~",
        KeyCode::PageDown => "\x1b[6~",
        KeyCode::Delete => "\x1b[3~",
        _ => return None,
    };
    Some(seq.to_string())
}
