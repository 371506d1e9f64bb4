use tracing::{info, warn};

use crate::commands::executable::{Context, Executable};
use crate::commands::CommandParser;
use crate::frame::Response;
use crate::Error;

/// Creates an account. Requires a logged-in connection; fails if the username is taken.
#[derive(Debug, PartialEq)]
pub struct CreateAccount {
    pub username: String,
    pub credential: String,
}

impl Executable for CreateAccount {
    fn exec(self, ctx: &mut Context<'_>) -> Result<Response, Error> {
        let mut tables = ctx.manager.lock();

        if ctx.current_user(&tables).is_none() || self.username.is_empty() {
            return Ok(Response::Failure);
        }

        let res = match tables.create_account(&self.username, &self.credential) {
            Ok(user_id) => {
                info!(user_id, "Created account {}", self.username);
                Response::Success
            }
            Err(e) => {
                warn!("Failed to create account: {}", e);
                Response::Failure
            }
        };

        Ok(res)
    }
}

impl TryFrom<&mut CommandParser<'_>> for CreateAccount {
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
