use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use rcmd::commands::{Dispatcher, DispatcherConfig, Opcode, UnknownOpcodePolicy};
use rcmd::frame::{self, FAILURE, SUCCESS};
use rcmd::peripheral::SimulatedLed;
use rcmd::server::{Server, ServerConfig, ServerError};

struct TestServer {
    addr: SocketAddr,
    led: Arc<SimulatedLed>,
    shutdown: CancellationToken,
    running: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    async fn stop(self) -> Result<(), ServerError> {
        self.shutdown.cancel();
        self.running.await.unwrap()
    }
}

async fn start(timeout: Duration, unknown_opcodes: UnknownOpcodePolicy) -> TestServer {
    let config = ServerConfig::default().with_timeout(timeout);

    start_with(config, unknown_opcodes).await
}

async fn start_with(config: ServerConfig, unknown_opcodes: UnknownOpcodePolicy) -> TestServer {
    let led = Arc::new(SimulatedLed::new());
    let dispatcher = Dispatcher::new(
        DispatcherConfig {
            unknown_opcodes,
            blink_cycles: 2,
            blink_interval: Duration::from_millis(10),
        },
        led.clone(),
    );
    let config = config.with_port("0").with_threads(2);

    let server = Server::bind(config, dispatcher).await.unwrap();
    let addr = server.local_addr();
    let shutdown = CancellationToken::new();
    let running = tokio::spawn(server.run(shutdown.clone()));

    TestServer {
        addr,
        led,
        shutdown,
        running,
    }
}

struct Client {
    stream: TcpStream,
}

impl Client {
    fn connect(addr: SocketAddr) -> Client {
        let stream = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
        stream
            .set_read_timeout(Some(std::time::Duration::from_secs(5)))
            .unwrap();
        Client { stream }
    }

    fn send(&mut self, opcode: u8, fields: &[&[u8]]) {
        let bytes = frame::request(opcode, fields).unwrap();
        self.stream.write_all(&bytes).unwrap();
    }

    fn status(&mut self) -> u8 {
        let mut status = [0u8; 1];
        self.stream.read_exact(&mut status).unwrap();
        status[0]
    }

    fn u16(&mut self) -> u16 {
        let mut buf = [0u8; 2];
        self.stream.read_exact(&mut buf).unwrap();
        u16::from_be_bytes(buf)
    }

    fn field(&mut self) -> Vec<u8> {
        let mut field = vec![0u8; self.u16() as usize];
        self.stream.read_exact(&mut field).unwrap();
        field
    }

    fn login(&mut self, username: &str, credential: &str) -> Option<u32> {
        self.send(
            Opcode::Login as u8,
            &[username.as_bytes(), credential.as_bytes()],
        );
        if self.status() != SUCCESS {
            return None;
        }

        let mut id = [0u8; 4];
        self.stream.read_exact(&mut id).unwrap();
        Some(u32::from_be_bytes(id))
    }

    /// True once the server has closed its end of the connection.
    fn is_closed(&mut self) -> bool {
        let mut buf = [0u8; 1];
        match self.stream.read(&mut buf) {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) => matches!(e.kind(), ErrorKind::ConnectionReset),
        }
    }
}

/// Runs blocking client code off the runtime threads.
async fn blocking<T, F>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_led_on_then_idle_timeout() {
    let server = start(Duration::from_millis(300), UnknownOpcodePolicy::Ignore).await;
    let addr = server.addr;

    blocking(move || {
        let mut client = Client::connect(addr);
        client.send(Opcode::LedOn as u8, &[]);
        assert_eq!(client.status(), SUCCESS);

        thread::sleep(std::time::Duration::from_millis(600));
        assert!(client.is_closed());
    })
    .await;
    assert!(server.led.is_lit());

    // The worker that timed out is free to serve the next client.
    blocking(move || {
        let mut client = Client::connect(addr);
        client.send(Opcode::LedOff as u8, &[]);
        assert_eq!(client.status(), SUCCESS);
    })
    .await;
    assert!(!server.led.is_lit());

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_blink() {
    let server = start(Duration::from_secs(5), UnknownOpcodePolicy::Ignore).await;
    let addr = server.addr;

    blocking(move || {
        let mut client = Client::connect(addr);
        client.send(Opcode::Blink as u8, &[]);
        assert_eq!(client.status(), SUCCESS);
    })
    .await;

    assert!(!server.led.is_lit());
    // Two on/off cycles, then the final switch off.
    assert_eq!(server.led.writes(), 5);

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_login() {
    let server = start(Duration::from_secs(5), UnknownOpcodePolicy::Ignore).await;
    let addr = server.addr;

    blocking(move || {
        let mut client = Client::connect(addr);
        assert_eq!(client.login("admin", "wrong"), None);
        assert_eq!(client.login("admin", "password"), Some(1000));

        let mut other = Client::connect(addr);
        assert_eq!(other.login("admin", "password"), Some(1001));
    })
    .await;

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_custom_tables_and_backlog() {
    let config = ServerConfig::default()
        .with_backlog(32)
        .with_bucket_count(7)
        .with_session_start(5000);
    let server = start_with(config, UnknownOpcodePolicy::Ignore).await;
    let addr = server.addr;

    blocking(move || {
        let mut client = Client::connect(addr);
        assert_eq!(client.login("admin", "password"), Some(5000));
        assert_eq!(client.login("admin", "password"), Some(5001));
    })
    .await;

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_account_creation() {
    let server = start(Duration::from_secs(5), UnknownOpcodePolicy::Ignore).await;
    let addr = server.addr;

    blocking(move || {
        let creators: Vec<_> = ["alice", "bob"]
            .into_iter()
            .map(|username| {
                thread::spawn(move || {
                    let mut client = Client::connect(addr);
                    assert!(client.login("admin", "password").is_some());
                    client.send(
                        Opcode::CreateAccount as u8,
                        &[username.as_bytes(), b"secret"],
                    );
                    client.status()
                })
            })
            .collect();

        for creator in creators {
            assert_eq!(creator.join().unwrap(), SUCCESS);
        }

        let mut client = Client::connect(addr);
        assert!(client.login("alice", "secret").is_some());
        assert!(client.login("bob", "secret").is_some());

        client.send(Opcode::CreateAccount as u8, &[b"alice", b"again"]);
        assert_eq!(client.status(), FAILURE);
    })
    .await;

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_data_commands() {
    let server = start(Duration::from_secs(5), UnknownOpcodePolicy::Ignore).await;
    let addr = server.addr;

    blocking(move || {
        let mut client = Client::connect(addr);

        client.send(Opcode::DataPut as u8, &[b"led/mode", b"blink"]);
        assert_eq!(client.status(), FAILURE);

        assert!(client.login("admin", "password").is_some());

        let entries: [(&[u8], &[u8]); 3] =
            [(b"led/mode", b"blink"), (b"led/pin", b"21"), (b"owner", b"me")];
        for (key, value) in entries {
            client.send(Opcode::DataPut as u8, &[key, value]);
            assert_eq!(client.status(), SUCCESS);
        }

        client.send(Opcode::DataGet as u8, &[b"led/pin"]);
        assert_eq!(client.status(), SUCCESS);
        assert_eq!(client.field(), b"21");

        client.send(Opcode::DataKeys as u8, &[b"led/*"]);
        assert_eq!(client.status(), SUCCESS);
        assert_eq!(client.u16(), 2);
        assert_eq!(client.field(), b"led/mode");
        assert_eq!(client.field(), b"led/pin");

        client.send(Opcode::DataDelete as u8, &[b"led/pin"]);
        assert_eq!(client.status(), SUCCESS);

        client.send(Opcode::DataGet as u8, &[b"led/pin"]);
        assert_eq!(client.status(), FAILURE);
    })
    .await;

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_session_ends_with_connection() {
    let server = start(Duration::from_secs(5), UnknownOpcodePolicy::Ignore).await;
    let addr = server.addr;

    blocking(move || {
        let mut client = Client::connect(addr);
        assert!(client.login("admin", "password").is_some());
        client.send(Opcode::Logout as u8, &[]);
        assert_eq!(client.status(), SUCCESS);
        client.send(Opcode::Logout as u8, &[]);
        assert_eq!(client.status(), FAILURE);
    })
    .await;

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_opcode_ignored() {
    let server = start(Duration::from_secs(5), UnknownOpcodePolicy::Ignore).await;
    let addr = server.addr;

    blocking(move || {
        let mut client = Client::connect(addr);
        client.stream.write_all(&[0x7f, Opcode::LedOn as u8]).unwrap();
        assert_eq!(client.status(), SUCCESS);
    })
    .await;

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_opcode_rejected() {
    let server = start(Duration::from_secs(5), UnknownOpcodePolicy::Reject).await;
    let addr = server.addr;

    blocking(move || {
        let mut client = Client::connect(addr);
        client.stream.write_all(&[0x7f, Opcode::LedOn as u8]).unwrap();
        assert_eq!(client.status(), FAILURE);
        assert_eq!(client.status(), SUCCESS);
    })
    .await;

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_opcode_disconnects() {
    let server = start(Duration::from_secs(5), UnknownOpcodePolicy::Disconnect).await;
    let addr = server.addr;

    blocking(move || {
        let mut client = Client::connect(addr);
        client.stream.write_all(&[0x7f]).unwrap();
        assert!(client.is_closed());
    })
    .await;

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_more_clients_than_workers() {
    let server = start(Duration::from_secs(5), UnknownOpcodePolicy::Ignore).await;
    let addr = server.addr;

    let statuses = blocking(move || {
        let clients: Vec<_> = (0..6)
            .map(|_| {
                thread::spawn(move || {
                    let mut client = Client::connect(addr);
                    client.send(Opcode::LedOn as u8, &[]);
                    client.status()
                })
            })
            .collect();

        clients
            .into_iter()
            .map(|client| client.join().unwrap())
            .collect::<Vec<_>>()
    })
    .await;

    assert_eq!(statuses, vec![SUCCESS; 6]);

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_clean_shutdown_with_idle_client() {
    let server = start(Duration::from_secs(30), UnknownOpcodePolicy::Ignore).await;

    let mut idle = Client::connect(server.addr);
    idle.send(Opcode::LedOn as u8, &[]);
    sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(5), server.stop())
        .await
        .unwrap()
        .unwrap();

    blocking(move || {
        assert_eq!(idle.status(), SUCCESS);
        assert!(idle.is_closed());
    })
    .await;
}
