use tracing::{info, warn};

use crate::commands::executable::{Context, Executable};
use crate::commands::CommandParser;
use crate::frame::Response;
use crate::Error;

/// Checks the credential of an account and opens a session for the connection. A connection that
/// is already logged in gives up its previous session.
#[derive(Debug, PartialEq)]
pub struct Login {
    pub username: String,
    pub credential: String,
}

impl Executable for Login {
    fn exec(self, ctx: &mut Context<'_>) -> Result<Response, Error> {
        let mut tables = ctx.manager.lock();

        if let Some(previous) = ctx.session.take() {
            // Already gone if the account was deleted in the meantime.
            let _ = tables.end_session(previous);
        }

        let res = match tables.authenticate(&self.username, &self.credential) {
            Ok(session_id) => {
                info!(%session_id, "User {} logged in", self.username);
                ctx.session = Some(session_id);
                Response::Session(session_id)
            }
            Err(e) => {
                warn!("Login failed: {}", e);
                Response::Failure
            }
        };

        Ok(res)
    }
}

impl TryFrom<&mut CommandParser<'_>> for Login {
    type Error = Error;

    fn try_from(parser: &mut CommandParser<'_>) -> Result<Self, Self::Error> {
        let username = parser.next_string()?;
        let credential = parser.next_string()?;

        Ok(Self {
            username,
            credential,
        })
    }
}
