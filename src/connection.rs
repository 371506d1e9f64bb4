use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};
use thiserror::Error as ThisError;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

// Upper bound on how long a blocked read goes without checking the shutdown token.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, ThisError)]
pub enum ConnectionError {
    #[error("connection error; peer closed the connection")]
    Closed,
    #[error("connection error; peer closed the connection in the middle of a request")]
    UnexpectedEof,
    #[error("connection error; no data received for {0:?}")]
    TimedOut(Duration),
    #[error("connection error; server is shutting down")]
    Shutdown,
    #[error("connection error; {0}")]
    Io(#[from] io::Error),
}

/// A blocking client connection owned by a worker thread.
///
/// Every read waits at most `timeout` for data and returns early once the shutdown token is
/// cancelled. Writes are bounded by the send timeout set on the socket when it was accepted.
pub struct Connection {
    pub id: Uuid,
    pub client_address: SocketAddr,
    stream: TcpStream,
    timeout: Duration,
    shutdown: CancellationToken,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        client_address: SocketAddr,
        timeout: Duration,
        shutdown: CancellationToken,
    ) -> Connection {
        Connection {
            id: Uuid::new_v4(),
            client_address,
            stream,
            timeout,
            shutdown,
        }
    }

    /// Reads the next opcode byte. Returns `None` if the peer closed the connection cleanly.
    pub fn read_opcode(&mut self) -> Result<Option<u8>, ConnectionError> {
        let mut opcode = [0u8; 1];

        match self.read_exact(&mut opcode) {
            Ok(()) => Ok(Some(opcode[0])),
            Err(ConnectionError::Closed) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fills `buf` completely. Fails with `Closed` if the peer hung up before sending anything
    /// and with `UnexpectedEof` if it hung up part way through.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ConnectionError> {
        let deadline = Instant::now() + self.timeout;
        let mut filled = 0;

        while filled < buf.len() {
            if self.shutdown.is_cancelled() {
                return Err(ConnectionError::Shutdown);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ConnectionError::TimedOut(self.timeout));
            }
            self.stream
                .set_read_timeout(Some((deadline - now).min(POLL_INTERVAL)))?;

            match self.stream.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Err(ConnectionError::Closed),
                Ok(0) => return Err(ConnectionError::UnexpectedEof),
                Ok(n) => filled += n,
                Err(e) if is_retryable(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Shuts down both halves of the socket. The descriptor itself is closed on drop.
    pub fn close(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            // The peer may already be gone.
            debug!("Socket shutdown failed: {}", e);
        }
    }
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}
