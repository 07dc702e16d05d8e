//! Seam between pier and the CLI it hosts.
//!
//! pier does not parse flags or dispatch actions itself. It hands a split command line
//! to a [`CommandExecutor`] and relays whatever the executor writes through
//! [`InvocationIo`]. The same executor backs local runs and remote sessions.

use std::collections::BTreeMap;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub type Env = BTreeMap<String, String>;

/// Exit code reported when an executor fails instead of returning a code.
pub const INVOCATION_FAILURE_CODE: i32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub command_line: String,
    pub args: Vec<String>,
    pub env: Env,
}

impl CommandRequest {
    pub fn parse(command_line: &str, env: Env) -> Result<Self, CommandLineError> {
        Ok(Self {
            command_line: command_line.to_owned(),
            args: split_command_line(command_line)?,
            env,
        })
    }

    pub fn from_args(args: Vec<String>, env: Env) -> Self {
        Self {
            command_line: args.join(" "),
            args,
            env,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    /// The invocation wants the client to start/stop echoing typed input.
    Echo(bool),
    /// Always the last event of an invocation.
    Exit(i32),
}

/// The hosted CLI.
#[async_trait]
pub trait CommandExecutor: Send + Sync + 'static {
    async fn execute(&self, request: CommandRequest, io: &mut InvocationIo) -> anyhow::Result<i32>;
}

pub struct HelpContext<'a> {
    pub program: &'a str,
    pub topic: Option<&'a str>,
}

/// Help text rendering, provided by the hosted CLI.
pub trait HelpRenderer: Send + Sync {
    fn render_help(&self, context: &HelpContext<'_>) -> String;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandLineError {
    #[error("unterminated {0} quote")]
    UnterminatedQuote(char),
    #[error("trailing backslash")]
    TrailingEscape,
}

/// Splits a command line into arguments, honouring single quotes, double quotes and
/// backslash escapes the way a POSIX shell would for plain words.
pub fn split_command_line(line: &str) -> Result<Vec<String>, CommandLineError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(CommandLineError::UnterminatedQuote('\'')),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => return Err(CommandLineError::UnterminatedQuote('"')),
                        },
                        Some(c) => current.push(c),
                        None => return Err(CommandLineError::UnterminatedQuote('"')),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => return Err(CommandLineError::TrailingEscape),
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}

/// Output/input handles given to an executor for one invocation.
pub struct InvocationIo {
    output: mpsc::Sender<OutputEvent>,
    input: mpsc::UnboundedReceiver<Bytes>,
    cancel: watch::Receiver<bool>,
    pending: BytesMut,
}

impl InvocationIo {
    pub async fn stdout(&self, data: impl Into<Bytes>) -> io::Result<()> {
        self.emit(OutputEvent::Stdout(data.into())).await
    }

    pub async fn stderr(&self, data: impl Into<Bytes>) -> io::Result<()> {
        self.emit(OutputEvent::Stderr(data.into())).await
    }

    pub async fn set_echo(&self, enabled: bool) -> io::Result<()> {
        self.emit(OutputEvent::Echo(enabled)).await
    }

    async fn emit(&self, event: OutputEvent) -> io::Result<()> {
        self.output
            .send(event)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "invocation output closed"))
    }

    /// Next chunk of interactive input; `None` once the input side is closed.
    pub async fn read_input(&mut self) -> Option<Bytes> {
        if !self.pending.is_empty() {
            return Some(self.pending.split().freeze());
        }
        self.input.recv().await
    }

    /// Reads up to the next `\r` or `\n`, without the terminator.
    pub async fn read_line(&mut self) -> Option<String> {
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == b'\r' || *b == b'\n') {
                let line = self.pending.split_to(pos);
                let terminator = self.pending.split_to(1);
                if terminator[0] == b'\r' && self.pending.first() == Some(&b'\n') {
                    let _ = self.pending.split_to(1);
                }
                return Some(String::from_utf8_lossy(&line).into_owned());
            }
            match self.input.recv().await {
                Some(chunk) => self.pending.extend_from_slice(&chunk),
                None if self.pending.is_empty() => return None,
                None => {
                    let line = self.pending.split();
                    return Some(String::from_utf8_lossy(&line).into_owned());
                }
            }
        }
    }

    /// Resolves once the session asks the invocation to stop.
    pub async fn cancelled(&mut self) {
        let _ = self.cancel.wait_for(|cancelled| *cancelled).await;
    }
}

/// A running invocation, as seen by whoever launched it.
///
/// Input is unbounded: the launcher must never stall on an invocation that is not
/// reading, or it would stop seeing output and shutdown.
pub struct Invocation {
    input: Option<mpsc::UnboundedSender<Bytes>>,
    events: mpsc::Receiver<OutputEvent>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Invocation {
    pub fn spawn(
        executor: Arc<dyn CommandExecutor>,
        request: CommandRequest,
        buffer: usize,
    ) -> Self {
        let (output_tx, events) = mpsc::channel(buffer.max(1));
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (cancel, cancel_rx) = watch::channel(false);

        let mut io = InvocationIo {
            output: output_tx.clone(),
            input: input_rx,
            cancel: cancel_rx,
            pending: BytesMut::new(),
        };

        let task = tokio::spawn(async move {
            let command = request.args.first().cloned().unwrap_or_default();
            let outcome = AssertUnwindSafe(executor.execute(request, &mut io))
                .catch_unwind()
                .await;
            drop(io);
            let code = match outcome {
                Ok(Ok(code)) => code,
                Ok(Err(err)) => {
                    debug!(command = %command, error = %err, "invocation failed");
                    let _ = output_tx
                        .send(OutputEvent::Stderr(Bytes::from(format!("{err}\n"))))
                        .await;
                    INVOCATION_FAILURE_CODE
                }
                Err(_) => {
                    warn!(command = %command, "invocation panicked");
                    let _ = output_tx
                        .send(OutputEvent::Stderr(Bytes::from_static(b"command panicked\n")))
                        .await;
                    INVOCATION_FAILURE_CODE
                }
            };
            let _ = output_tx.send(OutputEvent::Exit(code)).await;
        });

        Self {
            input: Some(input_tx),
            events,
            cancel,
            task,
        }
    }

    pub async fn next_event(&mut self) -> Option<OutputEvent> {
        self.events.recv().await
    }

    /// Queues interactive input without waiting. Returns `false` once the invocation
    /// has finished and dropped its input side.
    pub fn send_input(&self, data: Bytes) -> bool {
        match &self.input {
            Some(input) => input.send(data).is_ok(),
            None => false,
        }
    }

    /// A detached input handle, for callers that pump input from their own task.
    pub fn input_sender(&self) -> Option<mpsc::UnboundedSender<Bytes>> {
        self.input.clone()
    }

    /// Requests termination and waits up to `grace` for the invocation to finish.
    /// Returns the exit code when it finished in time. Otherwise the task is aborted and
    /// this only returns once it has been torn down.
    pub async fn terminate(mut self, grace: Duration) -> Option<i32> {
        let _ = self.cancel.send(true);
        self.input.take();

        let events = &mut self.events;
        let drain = async move {
            let mut code = None;
            while let Some(event) = events.recv().await {
                if let OutputEvent::Exit(exit) = event {
                    code = Some(exit);
                }
            }
            code
        };
        let outcome = tokio::time::timeout(grace, drain).await;
        match outcome {
            Ok(code) => code,
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "invocation ignored termination; aborting");
                self.task.abort();
                let _ = self.task.await;
                None
            }
        }
    }
}
