//! Server side of one remote connection.
//!
//! A [`Session`] owns the inbound byte stream of a client, turns it into commands and
//! interactive input, runs at most one invocation at a time and relays that invocation's
//! output back through a single outbound queue.

mod editor;
mod render;

pub use editor::LineEditor;
pub use render::TerminalRenderer;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pier_proto::{encode, BannerSource, BannerStage, ControlDecoder, ControlFrame, SharedBanner};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::command::{
    CommandExecutor, CommandRequest, Env, Invocation, OutputEvent, INVOCATION_FAILURE_CODE,
};
use crate::telemetry::describe_wire;

/// Exit code for a command line that could not be split into arguments.
pub const PARSE_FAILURE_CODE: i32 = 2;

/// How long a lone `ESC` (or another partial envelope prefix) is held before it is
/// treated as a keystroke.
const ESCAPE_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub output_indent: String,
    pub queue_capacity: usize,
    pub termination_grace: Duration,
    pub outbound_buffer: usize,
    pub banner: Option<BannerSource>,
    pub env: Env,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output_indent: " ".to_owned(),
            queue_capacity: 8,
            termination_grace: Duration::from_secs(2),
            outbound_buffer: 64,
            banner: None,
            env: Env::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    AwaitingInput,
    Running,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Open => "open",
            SessionState::AwaitingInput => "awaiting_input",
            SessionState::Running => "running",
            SessionState::Closed => "closed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: Uuid,
    pub commands_run: u64,
    pub last_exit_code: Option<i32>,
    pub echo_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Disconnected,
    Shutdown,
    WriterGone,
}

/// The outbound queue is gone; nobody is listening any more.
#[derive(Debug)]
struct WriterGone;

struct Running {
    command_line: String,
    invocation: Invocation,
    stdout: BannerStage,
    stderr: BannerStage,
    renderer: TerminalRenderer,
    /// The open line, if any, belongs to stderr.
    last_on_stderr: bool,
}

enum Step {
    Inbound(Bytes),
    Output(Option<OutputEvent>),
    EscapeTimeout,
    Close(CloseReason),
}

pub struct Session {
    id: Uuid,
    config: Arc<SessionConfig>,
    executor: Arc<dyn CommandExecutor>,
    outbound: mpsc::Sender<Bytes>,
    decoder: ControlDecoder,
    editor: LineEditor,
    state: SessionState,
    echo_enabled: bool,
    running: Option<Running>,
    queue: VecDeque<String>,
    escape_deadline: Option<Instant>,
    last_exit_code: Option<i32>,
    commands_run: u64,
}

impl Session {
    pub fn new(
        id: Uuid,
        executor: Arc<dyn CommandExecutor>,
        config: Arc<SessionConfig>,
        outbound: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            id,
            config,
            executor,
            outbound,
            decoder: ControlDecoder::new(),
            editor: LineEditor::new(),
            state: SessionState::Open,
            echo_enabled: true,
            running: None,
            queue: VecDeque::new(),
            escape_deadline: None,
            last_exit_code: None,
            commands_run: 0,
        }
    }

    /// Drives the session until the client goes away or `shutdown` flips to `true`.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Bytes>,
        mut shutdown: watch::Receiver<bool>,
    ) -> SessionSummary {
        self.set_state(SessionState::AwaitingInput);

        let reason = loop {
            if self.decoder.holds_partial_prefix() {
                self.escape_deadline
                    .get_or_insert_with(|| Instant::now() + ESCAPE_TIMEOUT);
            } else {
                self.escape_deadline = None;
            }

            let step = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => Step::Close(CloseReason::Shutdown),
                data = inbound.recv() => match data {
                    Some(data) => Step::Inbound(data),
                    None => Step::Close(CloseReason::Disconnected),
                },
                event = next_output(&mut self.running) => Step::Output(event),
                _ = escape_timer(self.escape_deadline) => Step::EscapeTimeout,
            };

            let outcome = match step {
                Step::Inbound(data) => self.handle_inbound(data).await,
                Step::Output(event) => self.handle_output(event).await,
                Step::EscapeTimeout => match self.decoder.release_partial_prefix() {
                    Some(held) => self.handle_frame(ControlFrame::Raw(held)).await,
                    None => Ok(()),
                },
                Step::Close(reason) => break reason,
            };
            if outcome.is_err() {
                break CloseReason::WriterGone;
            }
        };

        self.close(reason).await
    }

    async fn handle_inbound(&mut self, data: Bytes) -> Result<(), WriterGone> {
        trace!(session_id = %self.id, wire = %describe_wire(&data), "inbound");
        self.decoder.push(&data);
        while let Some(item) = self.decoder.next() {
            match item {
                Ok(frame) => self.handle_frame(frame).await?,
                Err(err) => {
                    warn!(session_id = %self.id, error = %err, "dropping malformed control frame")
                }
            }
        }
        Ok(())
    }

    async fn handle_frame(&mut self, frame: ControlFrame) -> Result<(), WriterGone> {
        match frame {
            ControlFrame::Echo { enabled } => {
                debug!(session_id = %self.id, enabled, "client echo state");
                self.echo_enabled = enabled;
                Ok(())
            }
            ControlFrame::Exec { command_line } => self.dispatch(command_line).await,
            ControlFrame::Stderr(_) => {
                debug!(session_id = %self.id, "ignoring stderr frame from client");
                Ok(())
            }
            ControlFrame::Keypress { event } => {
                if self.running.is_some() {
                    self.forward_input(Bytes::from(event.sequence.into_bytes()));
                    return Ok(());
                }
                for line in self.editor.apply_key(&event) {
                    self.dispatch(line).await?;
                }
                Ok(())
            }
            ControlFrame::Raw(bytes) => {
                if self.running.is_some() {
                    self.forward_input(bytes);
                    return Ok(());
                }
                for line in self.editor.feed(&bytes) {
                    self.dispatch(line).await?;
                }
                Ok(())
            }
        }
    }

    fn forward_input(&self, data: Bytes) {
        let Some(running) = &self.running else {
            return;
        };
        if !running.invocation.send_input(data) {
            trace!(session_id = %self.id, command = %running.command_line, "invocation no longer reads input");
        }
    }

    async fn dispatch(&mut self, command_line: String) -> Result<(), WriterGone> {
        if self.running.is_none() {
            return self.start(command_line).await;
        }
        if self.queue.len() < self.config.queue_capacity {
            debug!(session_id = %self.id, command = %command_line, queued = self.queue.len() + 1, "queueing command");
            self.queue.push_back(command_line);
            return Ok(());
        }
        warn!(session_id = %self.id, command = %command_line, "session busy; rejecting command");
        self.send_stderr(format!("pier: busy, dropped command '{command_line}'\r\n"))
            .await
    }

    async fn start(&mut self, command_line: String) -> Result<(), WriterGone> {
        let request = match CommandRequest::parse(&command_line, self.config.env.clone()) {
            Ok(request) if request.args.is_empty() => return Ok(()),
            Ok(request) => request,
            Err(err) => {
                debug!(session_id = %self.id, command = %command_line, error = %err, "unparseable command line");
                self.last_exit_code = Some(PARSE_FAILURE_CODE);
                return self.send_stderr(format!("pier: {err}\r\n")).await;
            }
        };

        info!(session_id = %self.id, command = %command_line, "starting invocation");
        let banner = SharedBanner::new(self.config.banner.clone());
        let invocation = Invocation::spawn(
            Arc::clone(&self.executor),
            request,
            self.config.outbound_buffer,
        );
        self.running = Some(Running {
            command_line,
            invocation,
            stdout: BannerStage::new(banner.clone()),
            stderr: BannerStage::new(banner),
            renderer: TerminalRenderer::new(self.config.output_indent.as_bytes()),
            last_on_stderr: false,
        });
        self.commands_run += 1;
        self.set_state(SessionState::Running);
        Ok(())
    }

    async fn handle_output(&mut self, event: Option<OutputEvent>) -> Result<(), WriterGone> {
        let Some(running) = self.running.as_mut() else {
            return Ok(());
        };

        let event = event.unwrap_or(OutputEvent::Exit(INVOCATION_FAILURE_CODE));
        match event {
            OutputEvent::Stdout(data) | OutputEvent::Stderr(data) if data.is_empty() => Ok(()),
            OutputEvent::Stdout(data) => {
                running.last_on_stderr = false;
                let output = running.stdout.apply(&data);
                let rendered = render_output(&mut running.renderer, output.banner.as_deref(), output.chunk);
                self.send(rendered).await
            }
            OutputEvent::Stderr(data) => {
                running.last_on_stderr = true;
                let output = running.stderr.apply(&data);
                let rendered = render_output(&mut running.renderer, output.banner.as_deref(), output.chunk);
                self.send_stderr(rendered).await
            }
            OutputEvent::Echo(enabled) => {
                debug!(session_id = %self.id, enabled, "invocation echo state");
                self.echo_enabled = enabled;
                self.send(Bytes::from(encode(&ControlFrame::echo(enabled)))).await
            }
            OutputEvent::Exit(code) => {
                let on_stderr = running.last_on_stderr;
                match running.renderer.finish() {
                    Some(tail) if on_stderr => self.send_stderr(Bytes::from_static(tail)).await?,
                    Some(tail) => self.send(Bytes::from_static(tail)).await?,
                    None => {}
                }
                self.finish_invocation(code).await
            }
        }
    }

    async fn finish_invocation(&mut self, code: i32) -> Result<(), WriterGone> {
        if let Some(running) = self.running.take() {
            info!(session_id = %self.id, command = %running.command_line, exit_code = code, "invocation finished");
        }
        self.last_exit_code = Some(code);
        if !self.echo_enabled {
            // Echo never stays off past the invocation that disabled it.
            self.echo_enabled = true;
            self.send(Bytes::from(encode(&ControlFrame::echo(true)))).await?;
        }
        self.set_state(SessionState::AwaitingInput);

        while self.running.is_none() {
            let Some(next) = self.queue.pop_front() else {
                break;
            };
            self.start(next).await?;
        }
        Ok(())
    }

    async fn send(&self, data: Bytes) -> Result<(), WriterGone> {
        if data.is_empty() {
            return Ok(());
        }
        self.outbound.send(data).await.map_err(|_| WriterGone)
    }

    /// Error-stream output rides in a `stderr` envelope so the client can keep it apart.
    async fn send_stderr(&self, data: impl Into<Bytes>) -> Result<(), WriterGone> {
        let data = data.into();
        if data.is_empty() {
            return Ok(());
        }
        self.send(Bytes::from(encode(&ControlFrame::stderr(data)))).await
    }

    async fn close(mut self, reason: CloseReason) -> SessionSummary {
        if let Some(running) = self.running.take() {
            debug!(session_id = %self.id, command = %running.command_line, "terminating running invocation");
            match running.invocation.terminate(self.config.termination_grace).await {
                Some(code) => self.last_exit_code = Some(code),
                None => warn!(session_id = %self.id, "invocation did not acknowledge termination"),
            }
        }
        if !self.queue.is_empty() {
            debug!(session_id = %self.id, dropped = self.queue.len(), "discarding queued commands");
            self.queue.clear();
        }
        if let Some(rest) = self.decoder.flush() {
            trace!(session_id = %self.id, bytes = rest.len(), "discarding partial inbound data");
        }
        self.set_state(SessionState::Closed);
        info!(
            session_id = %self.id,
            reason = ?reason,
            commands = self.commands_run,
            last_exit_code = ?self.last_exit_code,
            "session closed"
        );
        SessionSummary {
            id: self.id,
            commands_run: self.commands_run,
            last_exit_code: self.last_exit_code,
            echo_enabled: self.echo_enabled,
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            trace!(session_id = %self.id, from = %self.state, to = %state, "session state");
            self.state = state;
        }
    }
}

async fn escape_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_output(running: &mut Option<Running>) -> Option<OutputEvent> {
    match running {
        Some(running) => running.invocation.next_event().await,
        None => std::future::pending().await,
    }
}

fn render_output(renderer: &mut TerminalRenderer, banner: Option<&[u8]>, chunk: &[u8]) -> Bytes {
    let mut out = Vec::new();
    if let Some(banner) = banner {
        out.extend(renderer.render(banner));
    }
    out.extend(renderer.render(chunk));
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::InvocationIo;
    use async_trait::async_trait;
    use pier_proto::keys::decode as decode_key;

    struct Script;

    #[async_trait]
    impl CommandExecutor for Script {
        async fn execute(&self, request: CommandRequest, io: &mut InvocationIo) -> anyhow::Result<i32> {
            match request.args[0].as_str() {
                "abc" => {
                    io.stdout("bar!").await?;
                    Ok(0)
                }
                "json" => {
                    io.stdout("{\"ok\":true}\n").await?;
                    Ok(0)
                }
                "ask" => {
                    io.set_echo(false).await?;
                    let line = io.read_line().await.unwrap_or_default();
                    io.set_echo(true).await?;
                    io.stdout(line).await?;
                    Ok(0)
                }
                "wait" => {
                    io.cancelled().await;
                    Ok(9)
                }
                "gate" => {
                    io.read_line().await;
                    Ok(0)
                }
                "key" => {
                    let key = io.read_input().await.unwrap_or_default();
                    io.stdout(if &key[..] == b"\x1b" { "escape" } else { "other" }).await?;
                    Ok(0)
                }
                "err" => anyhow::bail!("it broke"),
                other => {
                    io.stdout(other.to_owned()).await?;
                    Ok(0)
                }
            }
        }
    }

    struct Harness {
        inbound: mpsc::Sender<Bytes>,
        outbound: mpsc::Receiver<Bytes>,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<SessionSummary>,
        seen: Vec<u8>,
    }

    impl Harness {
        fn start(config: SessionConfig) -> Self {
            let (outbound_tx, outbound) = mpsc::channel(64);
            let (inbound, inbound_rx) = mpsc::channel(64);
            let (shutdown, shutdown_rx) = watch::channel(false);
            let session = Session::new(Uuid::new_v4(), Arc::new(Script), Arc::new(config), outbound_tx);
            let task = tokio::spawn(session.run(inbound_rx, shutdown_rx));
            Self {
                inbound,
                outbound,
                shutdown,
                task,
                seen: Vec::new(),
            }
        }

        async fn send(&self, data: impl Into<Bytes>) {
            self.inbound.send(data.into()).await.expect("session inbound");
        }

        async fn frame(&self, frame: ControlFrame) {
            self.send(encode(&frame)).await;
        }

        async fn read_until(&mut self, needle: &[u8]) -> Vec<u8> {
            while !contains(&self.seen, needle) {
                let chunk = self.outbound.recv().await.expect("session output");
                self.seen.extend_from_slice(&chunk);
            }
            self.seen.clone()
        }

        async fn stop(self) -> SessionSummary {
            self.shutdown.send(true).expect("shutdown");
            self.task.await.expect("session task")
        }
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|window| window == needle)
    }

    #[test_timeout::timeout]
    async fn raw_line_runs_command() {
        let mut harness = Harness::start(SessionConfig::default());
        harness.send("ab").await;
        harness.send("c\n").await;
        assert_eq!(harness.read_until(b"\r\n").await, b" bar!\r\n".to_vec());

        let summary = harness.stop().await;
        assert_eq!(summary.commands_run, 1);
        assert_eq!(summary.last_exit_code, Some(0));
    }

    #[test_timeout::timeout]
    async fn exec_and_keypress_frames_dispatch() {
        let mut harness = Harness::start(SessionConfig::default());
        harness.frame(ControlFrame::exec("hello")).await;
        harness.read_until(b" hello\r\n").await;

        for key in ["o", "k", "\r"] {
            harness.frame(ControlFrame::keypress(decode_key(key))).await;
        }
        harness.read_until(b" ok\r\n").await;
        assert_eq!(harness.stop().await.commands_run, 2);
    }

    #[test_timeout::timeout]
    async fn banner_is_shown_once_and_suppressed_for_json() {
        let config = SessionConfig {
            banner: Some(BannerSource::text("Welcome\n")),
            ..SessionConfig::default()
        };
        let mut harness = Harness::start(config);
        harness.frame(ControlFrame::exec("first")).await;
        assert_eq!(
            harness.read_until(b" first\r\n").await,
            b" Welcome\r\n\r\n first\r\n".to_vec()
        );

        harness.frame(ControlFrame::exec("json")).await;
        let seen = harness.read_until(b"}\r\n").await;
        assert!(seen.ends_with(b" first\r\n {\"ok\":true}\r\n"));
        harness.stop().await;
    }

    #[test_timeout::timeout]
    async fn prompts_toggle_echo_and_receive_input() {
        let mut harness = Harness::start(SessionConfig::default());
        harness.frame(ControlFrame::exec("ask")).await;
        harness.read_until(&encode(&ControlFrame::echo(false))).await;

        harness.send("s3cret\r").await;
        let seen = harness.read_until(b" s3cret\r\n").await;
        let on = encode(&ControlFrame::echo(true));
        assert!(contains(&seen, &on));
        assert!(harness.stop().await.echo_enabled);
    }

    #[test_timeout::timeout]
    async fn busy_session_queues_then_rejects() {
        let config = SessionConfig {
            queue_capacity: 1,
            ..SessionConfig::default()
        };
        let mut harness = Harness::start(config);
        harness.frame(ControlFrame::exec("gate")).await;
        harness.frame(ControlFrame::exec("queued")).await;
        harness.frame(ControlFrame::exec("dropped")).await;
        harness
            .read_until(b"pier: busy, dropped command 'dropped'\r\n")
            .await;

        harness.send("\n").await;
        let seen = harness.read_until(b" queued\r\n").await;
        assert!(!contains(&seen, b" dropped\r\n"));
        assert_eq!(harness.stop().await.commands_run, 2);
    }

    #[test_timeout::timeout]
    async fn failures_and_bad_frames_keep_session_open() {
        let mut harness = Harness::start(SessionConfig::default());
        harness.send(&b"\x1b_pier;bogus;1;x\x1b\\"[..]).await;
        harness.frame(ControlFrame::exec("err")).await;
        let seen = harness.read_until(b" it broke\r\n").await;
        assert_eq!(seen, encode(&ControlFrame::stderr(&b" it broke\r\n"[..])));
        harness.frame(ControlFrame::exec("'unbalanced")).await;
        harness.read_until(b"pier: unterminated ' quote\r\n").await;
        harness.frame(ControlFrame::exec("still-here")).await;
        harness.read_until(b" still-here\r\n").await;

        let summary = harness.stop().await;
        assert_eq!(summary.last_exit_code, Some(0));
        assert_eq!(summary.commands_run, 2);
    }

    #[test_timeout::timeout]
    async fn pasted_keypress_runs_every_line() {
        let mut harness = Harness::start(SessionConfig::default());
        harness
            .frame(ControlFrame::keypress(decode_key("first\nsecond\n")))
            .await;
        let seen = harness.read_until(b" second\r\n").await;
        assert_eq!(seen, b" first\r\n second\r\n".to_vec());
        assert_eq!(harness.stop().await.commands_run, 2);
    }

    #[test_timeout::timeout]
    async fn lone_escape_reaches_invocation_after_idle() {
        let mut harness = Harness::start(SessionConfig::default());
        harness.frame(ControlFrame::exec("key")).await;
        harness.send(&b"\x1b"[..]).await;
        harness.read_until(b" escape\r\n").await;
        assert_eq!(harness.stop().await.last_exit_code, Some(0));
    }

    #[test_timeout::timeout]
    async fn unread_input_never_blocks_shutdown() {
        let harness = Harness::start(SessionConfig::default());
        harness.frame(ControlFrame::exec("wait")).await;
        for _ in 0..256 {
            harness.send(&b"x"[..]).await;
        }

        let summary = tokio::time::timeout(Duration::from_secs(5), harness.stop())
            .await
            .expect("session must close while input is unread");
        assert_eq!(summary.last_exit_code, Some(9));
    }

    #[test_timeout::timeout]
    async fn shutdown_terminates_running_invocation() {
        let harness = Harness::start(SessionConfig::default());
        harness.frame(ControlFrame::exec("wait")).await;
        harness.frame(ControlFrame::echo(false)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let summary = harness.stop().await;
        assert_eq!(summary.last_exit_code, Some(9));
        assert!(!summary.echo_enabled);
    }
}
