use bytes::Bytes;

use crate::commands::executable::{Context, Executable};
use crate::commands::CommandParser;
use crate::frame::Response;
use crate::Error;

/// Returns the value stored under a key. Requires a logged-in connection.
#[derive(Debug, PartialEq)]
pub struct DataGet {
    pub key: Bytes,
}

impl Executable for DataGet {
    fn exec(self, ctx: &mut Context<'_>) -> Result<Response, Error> {
        let tables = ctx.manager.lock();

        if ctx.current_user(&tables).is_none() {
            return Ok(Response::Failure);
        }

        let res = tables
            .data
            .find(&self.key)
            .map_or(Response::Failure, |entry| Response::Field(entry.value.clone()));

        Ok(res)
    }
}

impl TryFrom<&mut CommandParser<'_>> for DataGet {
    type Error = Error;

    fn try_from(parser: &mut CommandParser<'_>) -> Result<Self, Self::Error> {
        let key = parser.next_bytes()?;

        Ok(Self { key })
    }
}
