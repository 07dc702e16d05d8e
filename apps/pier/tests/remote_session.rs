use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pier::client::{ClientError, ClientHandle, ConnectOptions, InputMode, RemoteClient, Terminal};
use pier::command::{CommandExecutor, CommandRequest, InvocationIo};
use pier::server::{listen, ListenerHandle, ListenerOptions, ServerError};
use pier::session::SessionConfig;
use pier_proto::{BannerSource, ControlFrame};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

struct DemoCli;

/// Invocations of `stubborn` whose future has not been dropped yet.
static STUBBORN_ALIVE: AtomicUsize = AtomicUsize::new(0);

struct Alive;

impl Alive {
    fn enter() -> Self {
        STUBBORN_ALIVE.fetch_add(1, Ordering::SeqCst);
        Alive
    }
}

impl Drop for Alive {
    fn drop(&mut self) {
        STUBBORN_ALIVE.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CommandExecutor for DemoCli {
    async fn execute(&self, request: CommandRequest, io: &mut InvocationIo) -> anyhow::Result<i32> {
        match request.args[0].as_str() {
            "abc" => {
                io.stdout("bar!").await?;
                Ok(0)
            }
            "json" => {
                io.stdout("{\"x\":1}").await?;
                Ok(0)
            }
            "secret" => {
                io.set_echo(false).await?;
                let answer = io.read_line().await.unwrap_or_default();
                io.set_echo(true).await?;
                io.stdout(if answer == "hunter2" { "ok" } else { "denied" }).await?;
                Ok(0)
            }
            "hang" => {
                io.cancelled().await;
                Ok(130)
            }
            "stubborn" => {
                let _alive = Alive::enter();
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(0)
            }
            other => {
                io.stderr(format!("unknown command '{other}'")).await?;
                Ok(127)
            }
        }
    }
}

struct Screen {
    keyboard: DuplexStream,
    stdout: DuplexStream,
    stderr: DuplexStream,
    seen: Vec<u8>,
}

impl Screen {
    async fn type_text(&mut self, text: &str) {
        self.keyboard.write_all(text.as_bytes()).await.expect("keyboard");
    }

    async fn read_until(&mut self, needle: &str) -> String {
        let mut buf = [0u8; 1024];
        while !String::from_utf8_lossy(&self.seen).contains(needle) {
            let n = self.stdout.read(&mut buf).await.expect("screen");
            assert!(n > 0, "screen closed before {needle:?}");
            self.seen.extend_from_slice(&buf[..n]);
        }
        String::from_utf8_lossy(&self.seen).into_owned()
    }

    async fn read_errors_until(&mut self, needle: &str) -> String {
        let mut seen = Vec::new();
        let mut buf = [0u8; 1024];
        while !String::from_utf8_lossy(&seen).contains(needle) {
            let n = self.stderr.read(&mut buf).await.expect("error stream");
            assert!(n > 0, "error stream closed before {needle:?}");
            seen.extend_from_slice(&buf[..n]);
        }
        String::from_utf8_lossy(&seen).into_owned()
    }
}

fn terminal() -> (Terminal, Screen) {
    let (input, keyboard) = duplex(4096);
    let (stdout, screen) = duplex(64 * 1024);
    let (stderr, errors) = duplex(4096);
    (
        Terminal::new(input, stdout, stderr),
        Screen {
            keyboard,
            stdout: screen,
            stderr: errors,
            seen: Vec::new(),
        },
    )
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .expect("ephemeral port")
        .port()
}

async fn start(config: SessionConfig) -> ListenerHandle {
    listen(ListenerOptions::new(free_port()), Arc::new(DemoCli), config)
        .await
        .expect("listener")
}

async fn attach(listener: &ListenerHandle, mode: InputMode) -> (ClientHandle, Screen) {
    let (terminal, screen) = terminal();
    let client = RemoteClient::connect(&listener.url(), ConnectOptions::new(terminal).with_mode(mode))
        .await
        .expect("connect");
    (client, screen)
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[test_timeout::timeout]
async fn typed_command_renders_like_a_local_run() {
    let listener = start(SessionConfig::default()).await;
    let (client, mut screen) = attach(&listener, InputMode::Raw).await;

    screen.type_text("abc\n").await;
    assert_eq!(screen.read_until("bar!\r\n").await, "abc\r\n bar!\r\n");

    client.close().await.expect("client close");
    listener.close().await.expect("listener close");
}

#[test_timeout::timeout]
async fn error_output_reaches_the_local_error_stream() {
    let listener = start(SessionConfig::default()).await;
    let (client, mut screen) = attach(&listener, InputMode::Raw).await;

    screen.type_text("nope\n").await;
    let errors = screen.read_errors_until("'nope'\r\n").await;
    assert_eq!(errors, " unknown command 'nope'\r\n");

    screen.type_text("abc\n").await;
    let seen = screen.read_until("bar!\r\n").await;
    assert_eq!(seen, "nope\r\nabc\r\n bar!\r\n");

    client.close().await.expect("client close");
    listener.close().await.expect("listener close");
}

#[test_timeout::timeout]
async fn second_listener_on_same_port_fails_and_first_keeps_working() {
    let first = start(SessionConfig::default()).await;
    let port = first.local_addr().port();

    let err = listen(ListenerOptions::new(port), Arc::new(DemoCli), SessionConfig::default())
        .await
        .err()
        .expect("second bind must fail");
    assert!(matches!(err, ServerError::AddressInUse { .. }), "{err:?}");

    let (client, mut screen) = attach(&first, InputMode::Line).await;
    screen.type_text("abc\r").await;
    assert_eq!(screen.read_until("bar!\r\n").await, "abc\r\n bar!\r\n");

    client.close().await.expect("client close");
    first.close().await.expect("listener close");
}

#[test_timeout::timeout]
async fn connect_without_terminal_is_invalid() {
    // The listener is never started; validation must fail before any I/O.
    let url = format!("ws://127.0.0.1:{}/ws", free_port());
    let err = RemoteClient::connect(&url, ConnectOptions::default())
        .await
        .err()
        .expect("must fail");
    assert!(matches!(err, ClientError::InvalidArgument(_)));

    let (terminal, _screen) = terminal();
    let err = RemoteClient::connect("ftp://example.com", ConnectOptions::new(terminal))
        .await
        .err()
        .expect("must fail");
    assert!(matches!(err, ClientError::InvalidArgument(_)));
}

#[test_timeout::timeout]
async fn invalid_port_is_rejected() {
    let err = listen(ListenerOptions::new(0), Arc::new(DemoCli), SessionConfig::default())
        .await
        .err()
        .expect("port 0 must fail");
    assert!(matches!(err, ServerError::InvalidArgument(_)));
}

#[test_timeout::timeout]
async fn prompts_switch_off_local_echo() {
    let listener = start(SessionConfig::default()).await;
    let (client, mut screen) = attach(&listener, InputMode::Raw).await;

    screen.type_text("secret\n").await;
    wait_for(|| !client.echo_enabled()).await;
    screen.type_text("hunter2\n").await;

    let seen = screen.read_until(" ok\r\n").await;
    assert_eq!(seen, "secret\r\n ok\r\n");
    wait_for(|| client.echo_enabled()).await;

    client.close().await.expect("client close");
    listener.close().await.expect("listener close");
}

#[test_timeout::timeout]
async fn banner_shows_once_and_never_before_json() {
    let config = SessionConfig {
        banner: Some(BannerSource::text("Welcome")),
        ..SessionConfig::default()
    };
    let listener = start(config).await;
    let (client, mut screen) = attach(&listener, InputMode::Keypress).await;

    screen.type_text("json\r").await;
    let seen = screen.read_until("}\r\n").await;
    assert!(!seen.contains("Welcome"));
    assert!(seen.ends_with(" {\"x\":1}\r\n"));

    client.send(ControlFrame::exec("abc")).await.expect("send");
    let seen = screen.read_until("bar!\r\n").await;
    assert!(seen.ends_with(" {\"x\":1}\r\n Welcome\r\n\r\n bar!\r\n"));

    client.close().await.expect("client close");
    listener.close().await.expect("listener close");
}

#[test_timeout::timeout]
async fn closing_listener_ends_running_sessions() {
    let listener = start(SessionConfig {
        termination_grace: Duration::from_secs(1),
        ..SessionConfig::default()
    })
    .await;
    let (client, mut screen) = attach(&listener, InputMode::Raw).await;
    wait_for(|| listener.active_sessions() == 1).await;

    screen.type_text("hang\n").await;
    screen.read_until("hang\r\n").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    listener.close().await.expect("listener close");
    client.wait().await.expect("server closed cleanly");
}

#[test_timeout::timeout]
async fn closing_listener_reaps_invocations_that_ignore_cancellation() {
    let listener = start(SessionConfig {
        termination_grace: Duration::from_millis(200),
        ..SessionConfig::default()
    })
    .await;
    let (client, mut screen) = attach(&listener, InputMode::Raw).await;
    wait_for(|| listener.active_sessions() == 1).await;

    screen.type_text("stubborn\n").await;
    screen.read_until("stubborn\r\n").await;
    wait_for(|| STUBBORN_ALIVE.load(Ordering::SeqCst) == 1).await;

    listener.close().await.expect("listener close");
    assert_eq!(STUBBORN_ALIVE.load(Ordering::SeqCst), 0);
    client.wait().await.expect("server closed cleanly");
}
