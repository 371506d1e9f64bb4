pub mod blink;
pub mod create_account;
pub mod data_delete;
pub mod data_get;
pub mod data_keys;
pub mod data_put;
pub mod delete_account;
pub mod executable;
pub mod led;
pub mod login;
pub mod logout;

use bytes::{Buf, Bytes};
use std::str;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::{Display, EnumIter, EnumString, FromRepr};
use thiserror::Error as ThisError;
use tracing::{debug, info, warn};

use crate::commands::executable::{Context, Executable};
use crate::connection::{Connection, ConnectionError};
use crate::frame::{FrameError, Response};
use crate::handler::{ClientHandle, RequestHandler};
use crate::peripheral::Peripheral;
use crate::Error;

use blink::Blink;
use create_account::CreateAccount;
use data_delete::DataDelete;
use data_get::DataGet;
use data_keys::DataKeys;
use data_put::DataPut;
use delete_account::DeleteAccount;
use led::{LedOff, LedOn};
use login::Login;
use logout::Logout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, FromRepr)]
#[repr(u8)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    Blink = 0x01,
    LedOn = 0x02,
    LedOff = 0x03,

    Login = 0x10,
    Logout = 0x11,
    CreateAccount = 0x12,
    DeleteAccount = 0x13,

    DataPut = 0x20,
    DataGet = 0x21,
    DataDelete = 0x22,
    DataKeys = 0x23,
}

/// What to do when a client sends a byte that is not a known opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum UnknownOpcodePolicy {
    /// Skip the byte and wait for the next opcode without answering.
    #[default]
    Ignore,
    /// Answer with a failure status and keep the connection open.
    Reject,
    /// Close the connection.
    Disconnect,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub unknown_opcodes: UnknownOpcodePolicy,
    pub blink_cycles: u32,
    pub blink_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            unknown_opcodes: UnknownOpcodePolicy::Ignore,
            blink_cycles: 3,
            blink_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum Command {
    Blink(Blink),
    LedOn(LedOn),
    LedOff(LedOff),

    Login(Login),
    Logout(Logout),
    CreateAccount(CreateAccount),
    DeleteAccount(DeleteAccount),

    DataPut(DataPut),
    DataGet(DataGet),
    DataDelete(DataDelete),
    DataKeys(DataKeys),
}

impl Executable for Command {
    fn exec(self, ctx: &mut Context<'_>) -> Result<Response, Error> {
        match self {
            Command::Blink(cmd) => cmd.exec(ctx),
            Command::LedOn(cmd) => cmd.exec(ctx),
            Command::LedOff(cmd) => cmd.exec(ctx),
            Command::Login(cmd) => cmd.exec(ctx),
            Command::Logout(cmd) => cmd.exec(ctx),
            Command::CreateAccount(cmd) => cmd.exec(ctx),
            Command::DeleteAccount(cmd) => cmd.exec(ctx),
            Command::DataPut(cmd) => cmd.exec(ctx),
            Command::DataGet(cmd) => cmd.exec(ctx),
            Command::DataDelete(cmd) => cmd.exec(ctx),
            Command::DataKeys(cmd) => cmd.exec(ctx),
        }
    }
}

impl Command {
    /// Reads the arguments of `opcode` from `parser`.
    pub fn parse(opcode: Opcode, parser: &mut CommandParser<'_>) -> Result<Command, Error> {
        match opcode {
            Opcode::Blink => Blink::try_from(parser).map(Command::Blink),
            Opcode::LedOn => LedOn::try_from(parser).map(Command::LedOn),
            Opcode::LedOff => LedOff::try_from(parser).map(Command::LedOff),
            Opcode::Login => Login::try_from(parser).map(Command::Login),
            Opcode::Logout => Logout::try_from(parser).map(Command::Logout),
            Opcode::CreateAccount => CreateAccount::try_from(parser).map(Command::CreateAccount),
            Opcode::DeleteAccount => DeleteAccount::try_from(parser).map(Command::DeleteAccount),
            Opcode::DataPut => DataPut::try_from(parser).map(Command::DataPut),
            Opcode::DataGet => DataGet::try_from(parser).map(Command::DataGet),
            Opcode::DataDelete => DataDelete::try_from(parser).map(Command::DataDelete),
            Opcode::DataKeys => DataKeys::try_from(parser).map(Command::DataKeys),
        }
    }
}

/// Where command arguments are read from: a live connection, or an in-memory buffer.
pub trait Source {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ConnectionError>;
}

impl Source for Connection {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ConnectionError> {
        Connection::read_exact(self, buf)
    }
}

impl Source for Bytes {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ConnectionError> {
        if self.remaining() < buf.len() {
            return Err(ConnectionError::UnexpectedEof);
        }

        self.copy_to_slice(buf);
        Ok(())
    }
}

/// Reads length-prefixed argument fields.
pub struct CommandParser<'a> {
    source: &'a mut dyn Source,
}

impl<'a> CommandParser<'a> {
    pub fn new(source: &'a mut dyn Source) -> CommandParser<'a> {
        CommandParser { source }
    }

    fn next_bytes(&mut self) -> Result<Bytes, FrameError> {
        let mut len = [0u8; 2];
        self.source.read_exact(&mut len)?;

        let mut field = vec![0u8; u16::from_be_bytes(len) as usize];
        self.source.read_exact(&mut field)?;

        Ok(Bytes::from(field))
    }

    fn next_string(&mut self) -> Result<String, FrameError> {
        let bytes = self.next_bytes()?;
        let string = str::from_utf8(&bytes[..])?;

        Ok(string.to_string())
    }
}

#[derive(Debug, ThisError, PartialEq)]
pub enum CommandError {
    #[error("protocol error; unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
}

/// The reference request dispatcher: reads one opcode at a time, runs the matching command and
/// writes its response, until the client leaves, times out, or the server shuts down.
pub struct Dispatcher {
    config: DispatcherConfig,
    peripheral: Arc<dyn Peripheral>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, peripheral: Arc<dyn Peripheral>) -> Dispatcher {
        Dispatcher { config, peripheral }
    }

    fn serve(&self, connection: &mut Connection, ctx: &mut Context<'_>) -> Result<(), Error> {
        loop {
            let opcode = match connection.read_opcode() {
                Ok(Some(opcode)) => opcode,
                Ok(None) => {
                    debug!("Connection closed by client");
                    return Ok(());
                }
                Err(ConnectionError::Shutdown) => {
                    info!("Shutdown requested, closing connection");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            let Some(opcode) = Opcode::from_repr(opcode) else {
                match self.config.unknown_opcodes {
                    UnknownOpcodePolicy::Ignore => {
                        debug!("Ignoring unknown opcode {:#04x}", opcode);
                    }
                    UnknownOpcodePolicy::Reject => {
                        debug!("Rejecting unknown opcode {:#04x}", opcode);
                        connection.write_all(&Response::Failure.encode()?)?;
                    }
                    UnknownOpcodePolicy::Disconnect => {
                        return Err(CommandError::UnknownOpcode(opcode).into());
                    }
                }
                continue;
            };

            let cmd = Command::parse(opcode, &mut CommandParser::new(&mut *connection))?;
            debug!(%opcode, "Received command {:?}", cmd);

            let res = cmd.exec(ctx)?;
            debug!(%opcode, success = res.is_success(), "Sending response {:?}", res);

            let bytes = match res.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(%opcode, "Failed to encode response: {}", e);
                    Response::Failure.encode()?
                }
            };
            connection.write_all(&bytes)?;
        }
    }
}

impl RequestHandler for Dispatcher {
    fn handle(&self, client: &mut ClientHandle) -> Result<(), Error> {
        let shutdown = client.connection.shutdown_token().clone();
        let mut ctx = Context {
            manager: &client.manager,
            peripheral: self.peripheral.as_ref(),
            config: &self.config,
            shutdown: &shutdown,
            session: None,
        };

        let result = self.serve(&mut client.connection, &mut ctx);

        // Sessions do not outlive the connection that opened them.
        if let Some(session_id) = ctx.session.take() {
            match ctx.manager.lock().end_session(session_id) {
                Ok(()) => debug!(%session_id, "Session ended"),
                Err(e) => warn!(%session_id, "Failed to end session: {}", e),
            }
        }

        result
    }
}
