use bytes::Bytes;

use crate::commands::executable::{Context, Executable};
use crate::commands::CommandParser;
use crate::frame::Response;
use crate::session::ADMIN_USER_ID;
use crate::Error;

/// Removes a key. Only the user that stored it, or the administrator, may remove it.
#[derive(Debug, PartialEq)]
pub struct DataDelete {
    pub key: Bytes,
}

impl Executable for DataDelete {
    fn exec(self, ctx: &mut Context<'_>) -> Result<Response, Error> {
        let mut tables = ctx.manager.lock();

        let Some(user_id) = ctx.current_user(&tables) else {
            return Ok(Response::Failure);
        };

        let allowed = match tables.data.find(&self.key) {
            Some(entry) => entry.owner == user_id || user_id == ADMIN_USER_ID,
            None => false,
        };
        if !allowed {
            return Ok(Response::Failure);
        }

        tables.data.remove(&self.key)?;

        Ok(Response::Success)
    }
}

impl TryFrom<&mut CommandParser<'_>> for DataDelete {
    type Error = Error;

    fn try_from(parser: &mut CommandParser<'_>) -> Result<Self, Self::Error> {
        let key = parser.next_bytes()?;

        Ok(Self { key })
    }
}
