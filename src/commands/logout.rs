use crate::commands::executable::{Context, Executable};
use crate::commands::CommandParser;
use crate::frame::Response;
use crate::Error;

/// Ends the connection's session.
#[derive(Debug, PartialEq)]
pub struct Logout;

impl Executable for Logout {
    fn exec(self, ctx: &mut Context<'_>) -> Result<Response, Error> {
        let Some(session_id) = ctx.session.take() else {
            return Ok(Response::Failure);
        };

        let res = match ctx.manager.lock().end_session(session_id) {
            Ok(()) => Response::Success,
            Err(_) => Response::Failure,
        };

        Ok(res)
    }
}

impl TryFrom<&mut CommandParser<'_>> for Logout {
    type Error = Error;

    fn try_from(_parser: &mut CommandParser<'_>) -> Result<Self, Self::Error> {
        Ok(Self)
    }
}
