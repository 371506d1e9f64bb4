use std::thread;

use crate::commands::executable::{Context, Executable};
use crate::commands::CommandParser;
use crate::frame::Response;
use crate::Error;

/// Blinks the LED for the configured number of cycles, stopping early if the server shuts down.
/// The LED is always left off.
#[derive(Debug, PartialEq)]
pub struct Blink;

impl Executable for Blink {
    fn exec(self, ctx: &mut Context<'_>) -> Result<Response, Error> {
        let blinked = blink(ctx);
        let off = ctx.peripheral.set_led(false);

        blinked?;
        off?;

        Ok(Response::Success)
    }
}

fn blink(ctx: &Context<'_>) -> Result<(), Error> {
    for _ in 0..ctx.config.blink_cycles {
        for on in [true, false] {
            if ctx.shutdown.is_cancelled() {
                return Ok(());
            }

            ctx.peripheral.set_led(on)?;
            thread::sleep(ctx.config.blink_interval);
        }
    }

    Ok(())
}

impl TryFrom<&mut CommandParser<'_>> for Blink {
    type Error = Error;

    fn try_from(_parser: &mut CommandParser<'_>) -> Result<Self, Self::Error> {
        Ok(Self)
    }
}
