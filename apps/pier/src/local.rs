//! In-process execution: the same executor and banner rules as a remote session,
//! writing straight to the caller's streams.

use std::io::{self, Write};
use std::sync::Arc;

use bytes::Bytes;
use pier_proto::{BannerWriter, SharedBanner};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use crate::command::{CommandExecutor, CommandRequest, Invocation, OutputEvent, INVOCATION_FAILURE_CODE};

const READ_CHUNK: usize = 1024;
const EVENT_BUFFER: usize = 64;

/// Runs one invocation locally and returns its exit code.
///
/// `stdout` and `stderr` share `banner`, so the banner shows at most once and only ahead
/// of the first real output.
pub async fn run_local<I, O, E>(
    executor: Arc<dyn CommandExecutor>,
    request: CommandRequest,
    input: I,
    stdout: O,
    stderr: E,
    banner: SharedBanner,
) -> io::Result<i32>
where
    I: AsyncRead + Send + Unpin + 'static,
    O: Write,
    E: Write,
{
    let mut stdout = BannerWriter::new(stdout, banner.clone());
    let mut stderr = BannerWriter::new(stderr, banner);
    let command = request.command_line.clone();
    let mut invocation = Invocation::spawn(executor, request, EVENT_BUFFER);
    let input_sender = invocation.input_sender();

    let pump = tokio::spawn(async move {
        let Some(sender) = input_sender else {
            return;
        };
        let mut input = input;
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match input.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if sender.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut code = INVOCATION_FAILURE_CODE;
    while let Some(event) = invocation.next_event().await {
        match event {
            OutputEvent::Stdout(data) => {
                stdout.write_all(&data)?;
                stdout.flush()?;
            }
            OutputEvent::Stderr(data) => {
                stderr.write_all(&data)?;
                stderr.flush()?;
            }
            OutputEvent::Echo(enabled) => trace!(enabled, "local echo request ignored"),
            OutputEvent::Exit(exit) => {
                code = exit;
                break;
            }
        }
    }
    pump.abort();
    debug!(command = %command, exit_code = code, "local invocation finished");
    Ok(code)
}
