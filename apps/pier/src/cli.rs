use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::client::InputMode;
use crate::server::{ListenerOptions, DEFAULT_HOST};
use crate::telemetry::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "pier",
    version,
    about = "Run a command-line tool locally or attach to it over a WebSocket session"
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "PIER_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        global = true,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "PIER_LOG_FILE",
        global = true,
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,

    #[arg(
        long = "log-filter",
        value_name = "DIRECTIVES",
        env = "PIER_LOG_FILTER",
        global = true,
        help = "Raw tracing filter directives, overriding --log-level"
    )]
    pub filter: Option<String>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
            filter: self.filter.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Host sessions on a WebSocket listener.
    Serve(ServeArgs),
    /// Attach this terminal to a remote session.
    Connect(ConnectArgs),
    /// Run one command in-process.
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(
        long,
        env = "PIER_PORT",
        default_value_t = 4100,
        value_parser = clap::value_parser!(u16).range(1..),
        help = "TCP port to listen on"
    )]
    pub port: u16,

    #[arg(long, env = "PIER_HOST", default_value_t = DEFAULT_HOST, help = "Address to bind")]
    pub host: IpAddr,

    #[arg(long, env = "PIER_BANNER", help = "Banner shown before the first output of each command")]
    pub banner: Option<String>,

    #[arg(long, default_value_t = 8, help = "Commands queued while one is running")]
    pub queue: usize,
}

impl ServeArgs {
    pub fn listener_options(&self) -> ListenerOptions {
        ListenerOptions::new(self.port).with_host(self.host)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    #[arg(env = "PIER_URL", default_value = "ws://127.0.0.1:4100/ws", help = "Session URL")]
    pub url: String,

    #[arg(long, value_enum, default_value_t = InputMode::Raw, help = "How typed input is sent")]
    pub mode: InputMode,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(long, env = "PIER_BANNER", help = "Banner shown before the first output")]
    pub banner: Option<String>,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub args: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test_timeout::timeout]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test_timeout::timeout]
    fn serve_defaults_to_loopback() {
        let cli = Cli::try_parse_from(["pier", "serve", "--port", "4200"]).expect("parse");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.listener_options().socket_addr().unwrap().to_string(), "127.0.0.1:4200");
    }

    #[test_timeout::timeout]
    fn serve_rejects_port_zero() {
        assert!(Cli::try_parse_from(["pier", "serve", "--port", "0"]).is_err());
    }

    #[test_timeout::timeout]
    fn run_keeps_trailing_flags() {
        let cli = Cli::try_parse_from(["pier", "--log-level", "debug", "run", "echo", "--loud"])
            .expect("parse");
        assert_eq!(cli.logging.level, LogLevel::Debug);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.args, vec!["echo", "--loud"]);
    }
}
