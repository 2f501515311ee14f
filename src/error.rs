//! Library errors

use std::{
    fmt::{Display, Formatter},
    io,
};

use miette::Diagnostic;
use thiserror::Error;

use crate::{command::CommandType, flasher::StubPhase};

#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("Error while communicating with the device")]
    #[diagnostic(transparent)]
    Connection(#[from] ConnectionError),

    #[error("The bootloader returned an error")]
    #[diagnostic(transparent)]
    RomError(#[from] RomError),

    #[error("Chip not recognized, read magic value {0:#010x}")]
    #[diagnostic(
        code(esploader::unrecognized_chip),
        help("If your chip is supported, try hard-resetting the device and try again")
    )]
    UnrecognizedChip(u32),

    #[error("Flash content verification failed at offset {offset:#010x}")]
    #[diagnostic(
        code(esploader::verify_failed),
        help("The MD5 digest reported by the chip does not match the written image; erase the region and flash again")
    )]
    VerifyFailed { offset: u32 },

    #[error("Failed to upload the flash stub while transferring the {phase} segment")]
    #[diagnostic(code(esploader::stub_load_failed))]
    StubLoadFailed {
        phase: StubPhase,
        #[source]
        source: Box<Error>,
    },

    #[error("The flash stub descriptor is malformed")]
    #[diagnostic(
        code(esploader::invalid_stub),
        help("A stub descriptor must carry entry, text, text_start, data and data_start fields with base64-encoded segments")
    )]
    InvalidStubDescriptor(#[source] StubParseError),
}

#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("IO error while using the transport: {0}")]
    #[diagnostic(code(esploader::transport_error))]
    Transport(#[from] io::Error),

    #[error("Failed to connect to the device")]
    #[diagnostic(
        code(esploader::connection_failed),
        help("Ensure that the device is connected and the reset and boot pins are not being held down")
    )]
    ConnectionFailed,

    #[error("Timeout while running {0}command")]
    #[diagnostic(code(esploader::timeout))]
    Timeout(TimedOutCommand),

    #[error("Received packet has invalid framing")]
    #[diagnostic(
        code(esploader::framing),
        help("Try hard-resetting the device and try again, if the error persists your ROM might be corrupted")
    )]
    FramingError,

    #[error("Received a reply for command {received:#04x} while running command {sent:#04x}")]
    #[diagnostic(
        code(esploader::mismatched_reply),
        help("The device and the host have gone out of step; hard-reset the device and try again")
    )]
    MismatchedReply { sent: u8, received: u8 },
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

#[derive(Debug, Default, Clone)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl From<CommandType> for TimedOutCommand {
    fn from(command: CommandType) -> Self {
        TimedOutCommand {
            command: Some(command),
        }
    }
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

/// Error codes returned by the ROM bootloader in the status tail of a reply.
#[derive(Copy, Clone, Debug, Error, Diagnostic)]
#[non_exhaustive]
#[repr(u8)]
pub enum RomErrorKind {
    #[error("Invalid message received")]
    #[diagnostic(code(esploader::rom::invalid_message))]
    InvalidMessage = 0x05,
    #[error("Bootloader failed to execute command")]
    #[diagnostic(code(esploader::rom::failed))]
    FailedToAct = 0x06,
    #[error("Received message has invalid CRC")]
    #[diagnostic(code(esploader::rom::crc))]
    InvalidCrc = 0x07,
    #[error("Bootloader failed to write to flash")]
    #[diagnostic(code(esploader::rom::flash_write))]
    FlashWriteError = 0x08,
    #[error("Bootloader failed to read from flash")]
    #[diagnostic(code(esploader::rom::flash_read))]
    FlashReadError = 0x09,
    #[error("Invalid length for flash read")]
    #[diagnostic(code(esploader::rom::flash_read_length))]
    FlashReadLengthError = 0x0a,
    #[error("Malformed compressed data received")]
    #[diagnostic(code(esploader::rom::deflate))]
    DeflateError = 0x0b,
    #[error("Other")]
    #[diagnostic(code(esploader::rom::other))]
    Other = 0xff,
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        match raw {
            0x05 => RomErrorKind::InvalidMessage,
            0x06 => RomErrorKind::FailedToAct,
            0x07 => RomErrorKind::InvalidCrc,
            0x08 => RomErrorKind::FlashWriteError,
            0x09 => RomErrorKind::FlashReadError,
            0x0a => RomErrorKind::FlashReadLengthError,
            0x0b => RomErrorKind::DeflateError,
            _ => RomErrorKind::Other,
        }
    }
}

/// An error reply from the chip, tagged with the command that triggered it.
#[derive(Copy, Clone, Debug, Error, Diagnostic)]
#[non_exhaustive]
#[error("Error while running {command} command")]
pub struct RomError {
    command: CommandType,
    #[source]
    kind: RomErrorKind,
}

impl RomError {
    pub fn new(command: CommandType, kind: RomErrorKind) -> RomError {
        RomError { command, kind }
    }
}

/// Reasons a stub descriptor failed to decode.
#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum StubParseError {
    #[error("Descriptor is not a valid TOML document")]
    Toml(#[from] toml::de::Error),
    #[error("Segment data is not valid base64")]
    Base64(#[from] base64::DecodeError),
}

pub(crate) trait ResultExt {
    /// Mark the command from which this error originates.
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::Timeout(_))) => {
                Err(Error::Connection(ConnectionError::Timeout(command.into())))
            }
            res => res,
        }
    }
}
