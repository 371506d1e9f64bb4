use crate::commands::executable::{Context, Executable};
use crate::commands::CommandParser;
use crate::frame::Response;
use crate::Error;

/// Turns the LED on.
#[derive(Debug, PartialEq)]
pub struct LedOn;

/// Turns the LED off.
#[derive(Debug, PartialEq)]
pub struct LedOff;

impl Executable for LedOn {
    fn exec(self, ctx: &mut Context<'_>) -> Result<Response, Error> {
        ctx.peripheral.set_led(true)?;
        Ok(Response::Success)
    }
}

impl Executable for LedOff {
    fn exec(self, ctx: &mut Context<'_>) -> Result<Response, Error> {
        ctx.peripheral.set_led(false)?;
        Ok(Response::Success)
    }
}

impl TryFrom<&mut CommandParser<'_>> for LedOn {
    type Error = Error;

    fn try_from(_parser: &mut CommandParser<'_>) -> Result<Self, Self::Error> {
        Ok(Self)
    }
}

impl TryFrom<&mut CommandParser<'_>> for LedOff {
    type Error = Error;

    fn try_from(_parser: &mut CommandParser<'_>) -> Result<Self, Self::Error> {
        Ok(Self)
    }
}
