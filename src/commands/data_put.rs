use bytes::Bytes;
use std::time::SystemTime;

use crate::commands::executable::{Context, Executable};
use crate::commands::CommandParser;
use crate::frame::Response;
use crate::session::DataEntry;
use crate::Error;

/// Stores a value under a new key, owned by the logged-in user. Existing keys are never
/// overwritten.
#[derive(Debug, PartialEq)]
pub struct DataPut {
    pub key: Bytes,
    pub value: Bytes,
}

impl Executable for DataPut {
    fn exec(self, ctx: &mut Context<'_>) -> Result<Response, Error> {
        let mut tables = ctx.manager.lock();

        let Some(owner) = ctx.current_user(&tables) else {
            return Ok(Response::Failure);
        };

        let entry = DataEntry {
            owner,
            value: self.value,
            updated_at: SystemTime::now(),
        };

        let res = match tables.data.insert(self.key, entry) {
            Ok(()) => Response::Success,
            Err(_) => Response::Failure,
        };

        Ok(res)
    }
}

impl TryFrom<&mut CommandParser<'_>> for DataPut {
    type Error = Error;

    fn try_from(parser: &mut CommandParser<'_>) -> Result<Self, Self::Error> {
        let key = parser.next_bytes()?;
        let value = parser.next_bytes()?;

        Ok(Self { key, value })
    }
}
