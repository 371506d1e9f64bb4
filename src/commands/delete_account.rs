use tracing::{info, warn};

use crate::commands::executable::{Context, Executable};
use crate::commands::CommandParser;
use crate::frame::Response;
use crate::session::ADMIN_USER_ID;
use crate::Error;

/// Deletes an account and ends all of its sessions. Users may delete their own account; the
/// administrator may delete any account.
#[derive(Debug, PartialEq)]
pub struct DeleteAccount {
    pub username: String,
}

impl Executable for DeleteAccount {
    fn exec(self, ctx: &mut Context<'_>) -> Result<Response, Error> {
        let mut tables = ctx.manager.lock();

        let Some(user_id) = ctx.current_user(&tables) else {
            return Ok(Response::Failure);
        };

        let allowed = match tables.accounts.find(self.username.as_bytes()) {
            Some(account) => account.user_id == user_id || user_id == ADMIN_USER_ID,
            None => false,
        };
        if !allowed {
            warn!(user_id, "Not allowed to delete account {}", self.username);
            return Ok(Response::Failure);
        }

        let res = match tables.delete_account(&self.username) {
            Ok(ended) => {
                info!(sessions_ended = ended, "Deleted account {}", self.username);
                Response::Success
            }
            Err(_) => Response::Failure,
        };

        Ok(res)
    }
}

impl TryFrom<&mut CommandParser<'_>> for DeleteAccount {
    type Error = Error;

    fn try_from(parser: &mut CommandParser<'_>) -> Result<Self, Self::Error> {
        let username = parser.next_string()?;

        Ok(Self { username })
    }
}
