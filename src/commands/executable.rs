use tokio_util::sync::CancellationToken;

use crate::commands::DispatcherConfig;
use crate::frame::Response;
use crate::peripheral::Peripheral;
use crate::session::{SessionId, SessionManager, SessionManagerLocked, UserId};
use crate::Error;

/// Everything a command can touch while it runs on behalf of one connection.
pub struct Context<'a> {
    pub manager: &'a SessionManager,
    pub peripheral: &'a dyn Peripheral,
    pub config: &'a DispatcherConfig,
    pub shutdown: &'a CancellationToken,
    /// Session opened by this connection, if it has logged in.
    pub session: Option<SessionId>,
}

impl<'a> Context<'a> {
    /// The user behind this connection's session. `None` if the connection never logged in or
    /// its session has since been ended, e.g. by deleting the account.
    pub fn current_user(&self, tables: &SessionManagerLocked<'_>) -> Option<UserId> {
        self.session
            .and_then(|session_id| tables.session(session_id))
            .map(|session| session.user_id)
    }
}

pub trait Executable {
    fn exec(self, ctx: &mut Context<'_>) -> Result<Response, Error>;
}
