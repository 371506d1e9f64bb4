use std::sync::Arc;
use tracing::debug;

use crate::connection::Connection;
use crate::session::SessionManager;
use crate::Error;

/// Per-connection state handed to a worker: the client socket and the shared tables.
pub struct ClientHandle {
    pub connection: Connection,
    pub manager: Arc<SessionManager>,
}

impl ClientHandle {
    pub fn new(connection: Connection, manager: Arc<SessionManager>) -> ClientHandle {
        ClientHandle {
            connection,
            manager,
        }
    }

    /// Closes the socket and drops the handle's reference to the shared tables.
    pub fn release(self) {
        self.connection.close();
        debug!(
            connection_id = %self.connection.id,
            client_address = %self.connection.client_address,
            "Connection released"
        );
    }
}

/// The application side of the server: invoked once per accepted connection, inside a worker.
///
/// Whatever the outcome, the server closes the socket and releases the handle once `handle`
/// returns. Errors end that connection only.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, client: &mut ClientHandle) -> Result<(), Error>;
}

impl<F> RequestHandler for F
where
    F: Fn(&mut ClientHandle) -> Result<(), Error> + Send + Sync + 'static,
{
    fn handle(&self, client: &mut ClientHandle) -> Result<(), Error> {
        self(client)
    }
}
