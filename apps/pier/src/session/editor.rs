use pier_proto::KeyEvent;

/// Collects idle keyboard input into command lines.
#[derive(Debug, Default)]
pub struct LineEditor {
    line: Vec<u8>,
    skip_lf: bool,
}

impl LineEditor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and returns every completed, non-blank line.
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in data {
            let skip_lf = std::mem::take(&mut self.skip_lf);
            match byte {
                b'\n' if skip_lf => {}
                b'\r' | b'\n' => {
                    self.skip_lf = byte == b'\r';
                    if let Some(line) = self.submit() {
                        lines.push(line);
                    }
                }
                0x08 | 0x7f => self.erase(),
                byte if byte < 0x20 => {}
                byte => self.line.push(byte),
            }
        }
        lines
    }

    /// Applies a decoded keypress. A pasted sequence can complete several lines.
    pub fn apply_key(&mut self, event: &KeyEvent) -> Vec<String> {
        if event.is_submit() {
            self.skip_lf = false;
            return self.submit().into_iter().collect();
        }
        if event.is_erase() {
            self.erase();
            return Vec::new();
        }
        if event.ctrl || event.meta {
            return Vec::new();
        }
        self.feed(event.sequence.as_bytes())
    }

    fn erase(&mut self) {
        // Drop a whole UTF-8 scalar, not a single byte.
        while let Some(byte) = self.line.pop() {
            if byte & 0xC0 != 0x80 {
                break;
            }
        }
    }

    fn submit(&mut self) -> Option<String> {
        let line = String::from_utf8_lossy(&self.line).trim().to_owned();
        self.line.clear();
        (!line.is_empty()).then_some(line)
    }
}
