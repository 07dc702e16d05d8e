use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

pub type TerminalInput = Box<dyn AsyncRead + Send + Unpin>;
pub type TerminalOutput = Box<dyn AsyncWrite + Send + Unpin>;

/// What a client needs from the local terminal: one input stream and two output streams.
pub struct Terminal {
    pub input: TerminalInput,
    pub stdout: TerminalOutput,
    pub stderr: TerminalOutput,
}

impl Terminal {
    pub fn new<I, O, E>(input: I, stdout: O, stderr: E) -> Self
    where
        I: AsyncRead + Send + Unpin + 'static,
        O: AsyncWrite + Send + Unpin + 'static,
        E: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            input: Box::new(input),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        }
    }

    /// The process' own stdin/stdout/stderr.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), tokio::io::stderr())
    }
}

impl fmt::Debug for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Terminal").finish_non_exhaustive()
    }
}
