const ESC: u8 = 0x1b;

/// Bytes to print locally for typed input while echo is on.
pub fn local_echo(chunk: &[u8]) -> Vec<u8> {
    if chunk.first() == Some(&ESC) {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(chunk.len() + 2);
    let mut after_cr = false;
    for &byte in chunk {
        match byte {
            b'\n' if after_cr => {}
            b'\r' | b'\n' => out.extend_from_slice(b"\r\n"),
            0x08 | 0x7f => out.extend_from_slice(b"\x08 \x08"),
            byte if byte < 0x20 => {}
            byte => out.push(byte),
        }
        after_cr = byte == b'\r';
    }
    out
}

/// Client-side line assembly for line mode.
#[derive(Debug, Default)]
pub struct LineBuffer {
    line: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            match byte {
                b'\r' | b'\n' => {
                    if !self.line.is_empty() {
                        lines.push(String::from_utf8_lossy(&self.line).into_owned());
                        self.line.clear();
                    }
                }
                0x08 | 0x7f => {
                    self.line.pop();
                }
                byte if byte < 0x20 => {}
                byte => self.line.push(byte),
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn echoes_printable_input_with_crlf() {
        assert_eq!(local_echo(b"abc\n"), b"abc\r\n".to_vec());
        assert_eq!(local_echo(b"ls\r\n"), b"ls\r\n".to_vec());
        assert_eq!(local_echo(b"x\x7f"), b"x\x08 \x08".to_vec());
        assert_eq!(local_echo(b"\x03\t"), Vec::<u8>::new());
        assert!(local_echo(b"\x1b[A").is_empty());
    }

    #[test_timeout::timeout]
    fn line_buffer_splits_complete_lines() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"ech").is_empty());
        assert_eq!(buffer.push(b"o hi\r\n\nhelpx\x7f\n"), vec!["echo hi", "help"]);
    }
}
