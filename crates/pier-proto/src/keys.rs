use serde::{Deserialize, Serialize};

const ESC: char = '\x1b';
const DEL: char = '\x7f';
const BACKSPACE: char = '\x08';

/// A single decoded keypress.
///
/// `sequence` always carries the raw chunk exactly as it was received so callers can
/// forward it untouched; `name` is only set when the chunk could be classified.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub sequence: String,
    #[serde(default)]
    pub ctrl: bool,
    #[serde(default)]
    pub meta: bool,
    #[serde(default)]
    pub shift: bool,
}

impl KeyEvent {
    fn unclassified(sequence: &str) -> Self {
        Self {
            sequence: sequence.to_owned(),
            ..Self::default()
        }
    }

    fn named(sequence: &str, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            sequence: sequence.to_owned(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// `enter` or `return`.
    pub fn is_submit(&self) -> bool {
        matches!(self.name(), Some("enter" | "return")) && !self.ctrl
    }

    pub fn is_erase(&self) -> bool {
        self.name() == Some("backspace")
    }
}

/// Classifies one input chunk.
///
/// Only single keys are understood. Real escape sequences (`ESC [` / `ESC O`, i.e.
/// arrows, function keys) are reported unclassified, and nothing is carried over
/// between calls.
pub fn decode(chunk: &str) -> KeyEvent {
    if chunk.is_empty() {
        return KeyEvent::default();
    }

    if let Some(rest) = chunk.strip_prefix(ESC) {
        return decode_escaped(chunk, rest);
    }

    match chunk {
        "\n" => return KeyEvent::named(chunk, "enter"),
        "\r" => return KeyEvent::named(chunk, "return"),
        " " => return KeyEvent::named(chunk, "space"),
        _ => {}
    }

    let mut chars = chunk.chars();
    let (Some(ch), None) = (chars.next(), chars.next()) else {
        return KeyEvent::unclassified(chunk);
    };

    if ch == BACKSPACE || ch == DEL {
        return KeyEvent::named(chunk, "backspace");
    }

    if (ch as u32) < ESC as u32 {
        let mut event = KeyEvent::unclassified(chunk);
        event.ctrl = true;
        event.name = control_letter(ch).map(String::from);
        return event;
    }

    if ch.is_ascii_alphanumeric() {
        return alphanumeric(chunk, ch, false);
    }

    KeyEvent::unclassified(chunk)
}

/// Lossy variant of [`decode`] for raw socket/terminal reads.
pub fn decode_bytes(chunk: &[u8]) -> KeyEvent {
    decode(&String::from_utf8_lossy(chunk))
}

fn decode_escaped(chunk: &str, rest: &str) -> KeyEvent {
    if rest.starts_with('O') || rest.starts_with('[') {
        return KeyEvent::unclassified(chunk);
    }

    if rest.chars().all(|ch| ch == ESC) {
        let mut event = KeyEvent::named(chunk, "escape");
        event.meta = true;
        return event;
    }

    let mut chars = rest.chars();
    if let (Some(ch), None) = (chars.next(), chars.next()) {
        if ch.is_ascii_alphanumeric() {
            return alphanumeric(chunk, ch, true);
        }
    }

    let mut event = KeyEvent::unclassified(chunk);
    event.meta = true;
    event
}

fn alphanumeric(chunk: &str, ch: char, meta: bool) -> KeyEvent {
    KeyEvent {
        name: Some(ch.to_ascii_lowercase().to_string()),
        sequence: chunk.to_owned(),
        ctrl: false,
        meta,
        shift: ch.is_ascii_uppercase(),
    }
}

/// Maps 0x01..=0x1a onto `a`..=`z`.
fn control_letter(ch: char) -> Option<char> {
    let code = ch as u32;
    if (1..=26).contains(&code) {
        char::from_u32(code - 1 + 'a' as u32)
    } else {
        None
    }
}
