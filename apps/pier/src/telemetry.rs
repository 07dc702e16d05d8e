//! Log subscriber setup and readable summaries of session traffic.

use std::fs::OpenOptions;
use std::path::PathBuf;

use clap::ValueEnum;
use pier_proto::{ControlDecoder, ControlFrame};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
    /// `EnvFilter` directives that replace the ones derived from `level`.
    pub filter: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid log filter '{filter}': {source}")]
    Filter { filter: String, source: ParseError },
    #[error("a global logger is already installed")]
    AlreadyInstalled,
}

/// pier's own crates log at `level`; dependencies (hyper, axum, tungstenite) never go
/// below info, their per-frame traces drown out session logs.
pub fn directives(level: LogLevel) -> String {
    let deps = level.min(LogLevel::Info).as_str();
    let own = level.as_str();
    format!("{deps},pier={own},pier_proto={own}")
}

/// Installs the global subscriber. Keep the guard alive until exit or buffered lines
/// are lost.
pub fn init(config: &LogConfig) -> Result<WorkerGuard, InitError> {
    let filter = match &config.filter {
        Some(filter) => EnvFilter::try_new(filter).map_err(|source| InitError::Filter {
            filter: filter.clone(),
            source,
        })?,
        None => EnvFilter::new(directives(config.level)),
    };

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|_| InitError::AlreadyInstalled)?;
    Ok(guard)
}

const PREVIEW_LEN: usize = 48;

/// One-line description of a chunk of session traffic: control envelopes by name, plain
/// bytes escaped and truncated.
pub fn describe_wire(chunk: &[u8]) -> String {
    let mut decoder = ControlDecoder::new();
    decoder.push(chunk);

    let mut parts = Vec::new();
    for item in decoder.by_ref() {
        parts.push(match item {
            Ok(ControlFrame::Raw(bytes)) => format!("raw[{}] \"{}\"", bytes.len(), preview(&bytes)),
            Ok(ControlFrame::Echo { enabled }) => {
                format!("echo({})", if enabled { "on" } else { "off" })
            }
            Ok(ControlFrame::Exec { command_line }) => format!("exec {command_line:?}"),
            Ok(ControlFrame::Stderr(bytes)) => {
                format!("stderr[{}] \"{}\"", bytes.len(), preview(&bytes))
            }
            Ok(ControlFrame::Keypress { event }) => {
                let ctrl = if event.ctrl { "ctrl+" } else { "" };
                match event.name() {
                    Some(name) => format!("key {ctrl}{name}"),
                    None => format!("key {ctrl}\"{}\"", preview(event.sequence.as_bytes())),
                }
            }
            Err(err) => format!("malformed({err})"),
        });
    }
    if let Some(rest) = decoder.flush() {
        parts.push(format!("partial[{}] \"{}\"", rest.len(), preview(&rest)));
    }
    parts.join(" | ")
}

fn preview(bytes: &[u8]) -> String {
    let mut out: String = bytes
        .iter()
        .take(PREVIEW_LEN)
        .flat_map(|byte| std::ascii::escape_default(*byte))
        .map(char::from)
        .collect();
    if bytes.len() > PREVIEW_LEN {
        out.push_str("...");
    }
    out
}
