/// Adapts invocation output for a client terminal in raw mode.
///
/// Lines are prefixed with the configured indent and bare `\n` becomes `\r\n`.
#[derive(Debug, Clone)]
pub struct TerminalRenderer {
    indent: Vec<u8>,
    at_line_start: bool,
    after_cr: bool,
}

impl TerminalRenderer {
    pub fn new(indent: impl Into<Vec<u8>>) -> Self {
        Self {
            indent: indent.into(),
            at_line_start: true,
            after_cr: false,
        }
    }

    pub fn render(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(chunk.len() + self.indent.len() + 8);
        for &byte in chunk {
            match byte {
                b'\n' => {
                    if !self.after_cr {
                        out.push(b'\r');
                    }
                    out.push(b'\n');
                    self.at_line_start = true;
                    self.after_cr = false;
                }
                b'\r' => {
                    out.push(b'\r');
                    self.at_line_start = true;
                    self.after_cr = true;
                }
                _ => {
                    if self.at_line_start {
                        out.extend_from_slice(&self.indent);
                        self.at_line_start = false;
                    }
                    self.after_cr = false;
                    out.push(byte);
                }
            }
        }
        out
    }

    /// Terminates a dangling last line so the next prompt starts clean.
    pub fn finish(&mut self) -> Option<&'static [u8]> {
        let pending = !self.at_line_start;
        self.at_line_start = true;
        self.after_cr = false;
        pending.then_some(b"\r\n".as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn indents_lines_and_translates_newlines() {
        let mut renderer = TerminalRenderer::new(" ");
        assert_eq!(renderer.render(b"one\ntwo\n"), b" one\r\n two\r\n".to_vec());
        assert_eq!(renderer.render(b"\n"), b"\r\n".to_vec());
        assert_eq!(renderer.finish(), None);
    }

    #[test_timeout::timeout]
    fn keeps_existing_crlf_and_splits() {
        let mut renderer = TerminalRenderer::new(" ");
        assert_eq!(renderer.render(b"a\r"), b" a\r".to_vec());
        assert_eq!(renderer.render(b"\nb"), b"\n b".to_vec());
        assert_eq!(renderer.render(b"c"), b"c".to_vec());
        assert_eq!(renderer.finish(), Some(b"\r\n".as_slice()));
    }

    #[test_timeout::timeout]
    fn unterminated_output_is_closed_on_finish() {
        let mut renderer = TerminalRenderer::new(" ");
        assert_eq!(renderer.render(b"bar!"), b" bar!".to_vec());
        assert_eq!(renderer.finish(), Some(b"\r\n".as_slice()));
    }
}
