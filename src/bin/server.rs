use clap::Parser;
use rcmd::commands::{Dispatcher, DispatcherConfig, UnknownOpcodePolicy};
use rcmd::peripheral::SimulatedLed;
use rcmd::server::{
    self, ServerConfig, DEFAULT_BACKLOG, DEFAULT_BUCKET_COUNT, DEFAULT_PORT, DEFAULT_SESSION_START,
    DEFAULT_THREADS,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// The port to listen on
    #[arg(short, long, env = "RCMD_PORT", default_value = DEFAULT_PORT)]
    port: String,

    /// Number of worker threads serving connections (at least 2)
    #[arg(short, long, env = "RCMD_THREADS", default_value_t = DEFAULT_THREADS)]
    threads: usize,

    /// Seconds a client may stay idle before its connection is dropped
    #[arg(long, env = "RCMD_TIMEOUT", default_value_t = 300)]
    timeout: u64,

    /// Pending connections the listening socket queues before refusing new ones
    #[arg(long, env = "RCMD_BACKLOG", default_value_t = DEFAULT_BACKLOG)]
    backlog: u32,

    /// Buckets in each of the account, session and data tables
    #[arg(long, env = "RCMD_BUCKETS", default_value_t = DEFAULT_BUCKET_COUNT)]
    buckets: usize,

    /// First session id handed out
    #[arg(long, env = "RCMD_SESSION_START", default_value_t = DEFAULT_SESSION_START)]
    session_start: u32,

    /// What to do with unknown opcodes: ignore, reject or disconnect
    #[arg(long, env = "RCMD_UNKNOWN_OPCODES", default_value = "ignore")]
    unknown_opcodes: UnknownOpcodePolicy,

    /// Number of on/off cycles performed by BLINK
    #[arg(long, env = "RCMD_BLINK_CYCLES", default_value_t = 3)]
    blink_cycles: u32,

    /// Milliseconds the LED stays in each state while blinking
    #[arg(long, env = "RCMD_BLINK_INTERVAL_MS", default_value_t = 500)]
    blink_interval_ms: u64,
}

#[tokio::main]
async fn main() -> rcmd::Result<()> {
    let _ = tracing_subscriber::fmt()
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let args = Args::parse();

    let config = ServerConfig::default()
        .with_port(args.port)
        .with_threads(args.threads)
        .with_timeout(Duration::from_secs(args.timeout))
        .with_backlog(args.backlog)
        .with_bucket_count(args.buckets)
        .with_session_start(args.session_start);

    let dispatcher = Dispatcher::new(
        DispatcherConfig {
            unknown_opcodes: args.unknown_opcodes,
            blink_cycles: args.blink_cycles,
            blink_interval: Duration::from_millis(args.blink_interval_ms),
        },
        Arc::new(SimulatedLed::new()),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    server::run(config, dispatcher, shutdown).await?;

    Ok(())
}

/// Cancels `shutdown` on Ctrl-C or SIGUSR1. A signal that cannot be listened for is logged and
/// the other one is still honoured.
async fn watch_signals(shutdown: CancellationToken) {
    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let user = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::user_defined1()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("SIGUSR1 received, shutting down");
            }
            Err(e) => {
                warn!("Failed to listen for SIGUSR1: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let user = std::future::pending::<()>();

    server::cancel_on_first(shutdown, interrupt, user).await;
}
