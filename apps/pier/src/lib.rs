pub mod builtin;
pub mod cli;
pub mod client;
pub mod command;
pub mod local;
pub mod server;
pub mod session;
pub mod telemetry;
