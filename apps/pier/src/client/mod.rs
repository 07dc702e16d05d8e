//! Client half: attaches a local terminal to a remote session.

mod echo;
mod terminal;

pub use echo::{local_echo, LineBuffer};
pub use terminal::{Terminal, TerminalInput, TerminalOutput};

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pier_proto::{
    encode, keys, BannerSource, BannerStage, ControlDecoder, ControlFrame, SharedBanner,
};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};
use url::Url;

const READ_CHUNK: usize = 1024;
const OUTGOING_BUFFER: usize = 64;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to connect: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("terminal i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed")]
    Closed,
}

/// How typed input travels to the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum InputMode {
    /// Every chunk is forwarded untouched.
    #[default]
    Raw,
    /// Every chunk is sent as a decoded keypress frame.
    Keypress,
    /// Input is edited locally and sent one line at a time as exec frames.
    Line,
}

#[derive(Debug, Default)]
pub struct ConnectOptions {
    pub terminal: Option<Terminal>,
    pub mode: InputMode,
    pub banner: Option<BannerSource>,
}

impl ConnectOptions {
    pub fn new(terminal: Terminal) -> Self {
        Self {
            terminal: Some(terminal),
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: InputMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_banner(mut self, banner: BannerSource) -> Self {
        self.banner = Some(banner);
        self
    }
}

pub struct RemoteClient;

/// A live connection.
pub struct ClientHandle {
    outgoing: mpsc::Sender<Message>,
    echo: Arc<AtomicBool>,
    input_task: JoinHandle<()>,
    render_task: JoinHandle<Result<(), ClientError>>,
    writer_task: JoinHandle<()>,
}

type SharedOutput = Arc<Mutex<TerminalOutput>>;

fn validate_url(url: &str) -> Result<Url, ClientError> {
    let parsed =
        Url::parse(url).map_err(|err| ClientError::InvalidArgument(format!("bad url '{url}': {err}")))?;
    match parsed.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(ClientError::InvalidArgument(format!(
                "unsupported url scheme '{other}', expected ws or wss"
            )))
        }
    }
    if parsed.host_str().is_none() {
        return Err(ClientError::InvalidArgument(format!("url '{url}' has no host")));
    }
    Ok(parsed)
}

impl RemoteClient {
    /// Validates `url` and `options`, then connects and wires the terminal.
    pub async fn connect(url: &str, options: ConnectOptions) -> Result<ClientHandle, ClientError> {
        let url = validate_url(url)?;
        let ConnectOptions {
            terminal,
            mode,
            banner,
        } = options;
        let terminal = terminal
            .ok_or_else(|| ClientError::InvalidArgument("a terminal is required".into()))?;

        let (stream, _) = connect_async(url.as_str()).await?;
        info!(url = %url, mode = ?mode, "connected");
        let (mut ws_tx, mut ws_rx) = stream.split();

        let Terminal {
            input,
            stdout,
            stderr,
        } = terminal;
        let stdout: SharedOutput = Arc::new(Mutex::new(stdout));
        let echo = Arc::new(AtomicBool::new(true));
        let (outgoing, mut outgoing_rx) = mpsc::channel::<Message>(OUTGOING_BUFFER);

        let writer_task = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if ws_tx.send(message).await.is_err() || closing {
                    break;
                }
            }
            debug!("client writer finished");
        });

        let input_task = tokio::spawn(pump_input(
            input,
            mode,
            Arc::clone(&stdout),
            Arc::clone(&echo),
            outgoing.clone(),
        ));

        let render_echo = Arc::clone(&echo);
        let render_task = tokio::spawn(async move {
            let mut stderr = stderr;
            let banner = SharedBanner::new(banner);
            let mut stage = BannerStage::new(banner.clone());
            let mut stderr_stage = BannerStage::new(banner);
            let mut decoder = ControlDecoder::new();

            while let Some(message) = ws_rx.next().await {
                let data = match message {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Text(text)) => text.into_bytes(),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(error = %err, "connection lost");
                        let _ = stderr
                            .write_all(format!("pier: connection lost: {err}\r\n").as_bytes())
                            .await;
                        let _ = stderr.flush().await;
                        return Err(ClientError::Closed);
                    }
                };
                decoder.push(&data);
                while let Some(item) = decoder.next() {
                    match item {
                        Ok(ControlFrame::Echo { enabled }) => {
                            debug!(enabled, "remote echo state");
                            render_echo.store(enabled, Ordering::SeqCst);
                        }
                        Ok(ControlFrame::Raw(bytes)) => {
                            let output = stage.apply(&bytes);
                            write_output(&stdout, &output.to_vec()).await?;
                        }
                        Ok(ControlFrame::Stderr(bytes)) => {
                            let output = stderr_stage.apply(&bytes);
                            stderr.write_all(&output.to_vec()).await?;
                            stderr.flush().await?;
                        }
                        Ok(frame) => debug!(kind = frame.kind(), "ignoring frame from server"),
                        Err(err) => warn!(error = %err, "dropping malformed control frame"),
                    }
                }
            }
            if let Some(rest) = decoder.flush() {
                write_output(&stdout, &rest).await?;
            }
            debug!("server closed the session");
            Ok(())
        });

        Ok(ClientHandle {
            outgoing,
            echo,
            input_task,
            render_task,
            writer_task,
        })
    }
}

async fn write_output(output: &SharedOutput, data: &[u8]) -> Result<(), ClientError> {
    if data.is_empty() {
        return Ok(());
    }
    let mut output = output.lock().await;
    output.write_all(data).await?;
    output.flush().await?;
    Ok(())
}

async fn pump_input(
    mut input: TerminalInput,
    mode: InputMode,
    stdout: SharedOutput,
    echo: Arc<AtomicBool>,
    outgoing: mpsc::Sender<Message>,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut lines = LineBuffer::default();
    let mut partial_char = Vec::new();
    loop {
        let n = match input.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                warn!(error = %err, "terminal input failed");
                break;
            }
        };
        let chunk = &buf[..n];
        let key = keys::decode_bytes(chunk);
        trace!(key = ?key.name(), ctrl = key.ctrl, meta = key.meta, bytes = n, "terminal input");

        let echoing = echo.load(Ordering::SeqCst);
        if echoing {
            if let Err(err) = write_output(&stdout, &local_echo(chunk)).await {
                warn!(error = %err, "local echo failed");
            }
        }

        let payloads: Vec<Vec<u8>> = match mode {
            InputMode::Raw => vec![chunk.to_vec()],
            InputMode::Keypress => keypress_payloads(&mut partial_char, chunk),
            // With echo off a prompt is reading; its answer goes through as plain input.
            InputMode::Line if !echoing => vec![chunk.to_vec()],
            InputMode::Line => lines
                .push(chunk)
                .into_iter()
                .map(|line| encode(&ControlFrame::exec(line)))
                .collect(),
        };
        for payload in payloads {
            if outgoing.send(Message::Binary(payload)).await.is_err() {
                return;
            }
        }
    }
    debug!("terminal input closed");
}

/// Wraps typed input in keypress frames without altering it. A character split across
/// reads waits for its tail; bytes that are not UTF-8 at all go through as plain input.
fn keypress_payloads(partial: &mut Vec<u8>, chunk: &[u8]) -> Vec<Vec<u8>> {
    partial.extend_from_slice(chunk);
    let valid = match std::str::from_utf8(partial) {
        Ok(_) => partial.len(),
        Err(err) if err.error_len().is_none() => err.valid_up_to(),
        Err(_) => return vec![std::mem::take(partial)],
    };
    if valid == 0 {
        return Vec::new();
    }
    let tail = partial.split_off(valid);
    let text = String::from_utf8_lossy(&std::mem::replace(partial, tail)).into_owned();
    vec![encode(&ControlFrame::keypress(keys::decode(&text)))]
}

impl ClientHandle {
    /// Sends an explicit control frame. Echo frames also switch local echo.
    pub async fn send(&self, frame: ControlFrame) -> Result<(), ClientError> {
        if let ControlFrame::Echo { enabled } = frame {
            self.echo.store(enabled, Ordering::SeqCst);
        }
        self.outgoing
            .send(Message::Binary(encode(&frame)))
            .await
            .map_err(|_| ClientError::Closed)
    }

    pub fn echo_enabled(&self) -> bool {
        self.echo.load(Ordering::SeqCst)
    }

    /// Resolves once the server ends the session.
    pub async fn wait(mut self) -> Result<(), ClientError> {
        let result = (&mut self.render_task).await;
        self.shutdown_tasks();
        flatten(result)
    }

    /// Closes the connection from this side.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.input_task.abort();
        let _ = self.outgoing.send(Message::Close(None)).await;
        let result = match tokio::time::timeout(CLOSE_TIMEOUT, &mut self.render_task).await {
            Ok(result) => flatten(result),
            Err(_) => {
                self.render_task.abort();
                Ok(())
            }
        };
        self.shutdown_tasks();
        result
    }

    fn shutdown_tasks(self) {
        self.input_task.abort();
        self.writer_task.abort();
    }
}

fn flatten(result: Result<Result<(), ClientError>, tokio::task::JoinError>) -> Result<(), ClientError> {
    match result {
        Ok(result) => result,
        Err(err) if err.is_cancelled() => Ok(()),
        Err(err) => Err(ClientError::Io(io::Error::new(io::ErrorKind::Other, err))),
    }
}
