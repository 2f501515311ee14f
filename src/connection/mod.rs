//! The request/response channel to a target device
//!
//! [Connection] owns the [Transport] for the lifetime of a session and is the
//! only place that reads or writes it. Requests go out as single SLIP frames;
//! replies are collected byte by byte against a per-command deadline, so a
//! silent chip costs exactly the command's timeout and nothing more.

use std::{
    thread::sleep,
    time::{Duration, Instant},
};

use log::debug;

use crate::{
    command::Command,
    error::{ConnectionError, Error, ResultExt, RomError, RomErrorKind},
    slip,
    transport::Transport,
};

pub mod reset;

/// Replies larger than this have the excess discarded, matching the ROM
/// loaders, which never produce more.
const MAX_RESPONSE_SIZE: usize = 2048;
/// Header bytes preceding the body in a decoded reply frame.
const RESPONSE_HEADER_SIZE: usize = 8;

const SYNC_ATTEMPTS: usize = 7;
const SYNC_RETRY_DELAY: Duration = Duration::from_millis(50);
const READ_POLL_DELAY: Duration = Duration::from_millis(1);

/// A decoded reply from the target device.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    /// Direction marker, `0x01` for replies.
    pub resp: u8,
    /// Echo of the opcode being answered.
    pub return_op: u8,
    /// Body length as reported in the reply header.
    pub return_length: u16,
    /// The value word; carries the result of register reads.
    pub value: u32,
    /// Reply body, status tail included.
    pub data: Vec<u8>,
    /// Status code, zero for success.
    pub status: u8,
}

/// An established connection with a target device.
pub struct Connection {
    transport: Box<dyn Transport>,
    strict: bool,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Connection {
            transport,
            strict: false,
        }
    }

    /// Require the reply opcode to match the request.
    ///
    /// The ROM loaders echo the opcode but host tools traditionally ignore
    /// it, so this is off by default.
    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    /// Try to sync with the device.
    ///
    /// A fresh bootloader needs a few attempts before it answers; the
    /// transport is flushed before each one so stale bytes cannot be mistaken
    /// for a reply.
    pub fn sync(&mut self) -> Result<(), Error> {
        for attempt in 0..SYNC_ATTEMPTS {
            if attempt > 0 {
                sleep(SYNC_RETRY_DELAY);
            }

            match self.command(Command::Sync) {
                Ok(_) => return Ok(()),
                Err(err) => debug!("Sync attempt {} failed: {}", attempt + 1, err),
            }
        }

        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    /// Write a command and read the matching reply.
    pub fn command(&mut self, command: Command<'_>) -> Result<CommandResponse, Error> {
        let timeout = command.timeout();
        self.command_with_timeout(command, timeout)
    }

    /// Write a command and read the matching reply, overriding the command's
    /// own deadline.
    pub fn command_with_timeout(
        &mut self,
        command: Command<'_>,
        timeout: Duration,
    ) -> Result<CommandResponse, Error> {
        let ty = command.command_type();
        self.write_command(&command)?;

        let response = self.read_response(timeout).for_command(ty)?;

        if self.strict && response.return_op != ty as u8 {
            return Err(Error::Connection(ConnectionError::MismatchedReply {
                sent: ty as u8,
                received: response.return_op,
            }));
        }

        if response.status != 0 {
            return Err(Error::RomError(RomError::new(
                ty,
                RomErrorKind::from(response.status),
            )));
        }

        Ok(response)
    }

    /// Read a 32-bit register from the device.
    pub fn read_reg(&mut self, address: u32) -> Result<u32, Error> {
        let response = self.command(Command::ReadReg { address })?;
        Ok(response.value)
    }

    /// Discard any stale input and drain pending output.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.transport.flush()?;
        Ok(())
    }

    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    pub fn into_transport(self) -> Box<dyn Transport> {
        self.transport
    }

    fn write_command(&mut self, command: &Command<'_>) -> Result<(), Error> {
        debug!("Writing {} command", command.command_type());

        // A previous command may have timed out mid-reply; realign by
        // dropping whatever is still buffered before sending the next frame.
        self.transport.flush()?;

        let mut packet = Vec::new();
        command.write(&mut packet)?;
        self.transport.write(&slip::encode(&packet))?;
        Ok(())
    }

    /// Collect one reply frame, polling until `timeout` elapses.
    ///
    /// Bytes seen before an opening frame delimiter are discarded; a delimiter
    /// observed mid-frame closes it.
    fn read_response(&mut self, timeout: Duration) -> Result<CommandResponse, Error> {
        let deadline = Instant::now() + timeout;
        let mut frame = Vec::with_capacity(RESPONSE_HEADER_SIZE + MAX_RESPONSE_SIZE);
        let mut in_frame = false;
        let mut byte = [0u8; 1];

        while Instant::now() < deadline {
            if self.transport.read(&mut byte)? == 0 {
                sleep(READ_POLL_DELAY);
                continue;
            }

            match byte[0] {
                slip::END if in_frame => {
                    let response = parse_response(&slip::decode(&frame))?;
                    debug!(
                        "Received reply to {:#04x}: {} byte body, status {}",
                        response.return_op,
                        response.data.len(),
                        response.status
                    );
                    return Ok(response);
                }
                slip::END => {
                    in_frame = true;
                }
                data if in_frame => {
                    if frame.len() < RESPONSE_HEADER_SIZE + MAX_RESPONSE_SIZE {
                        frame.push(data);
                    }
                }
                _ => {} // Stray byte between frames, drop it.
            }
        }

        Err(Error::Connection(ConnectionError::Timeout(
            Default::default(),
        )))
    }
}

fn parse_response(frame: &[u8]) -> Result<CommandResponse, Error> {
    if frame.len() < RESPONSE_HEADER_SIZE {
        return Err(Error::Connection(ConnectionError::FramingError));
    }

    let data = frame[RESPONSE_HEADER_SIZE..].to_vec();
    let status = data.last().copied().unwrap_or(0);

    Ok(CommandResponse {
        resp: frame[0],
        return_op: frame[1],
        return_length: u16::from_le_bytes([frame[2], frame[3]]),
        value: u32::from_le_bytes(frame[4..8].try_into().unwrap()),
        data,
        status,
    })
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    /// Feeds a canned byte stream and records what gets written.
    struct ScriptedTransport {
        input: Vec<u8>,
        written: Vec<u8>,
    }

    impl ScriptedTransport {
        fn new(input: &[u8]) -> Self {
            ScriptedTransport {
                input: input.to_vec(),
                written: Vec::new(),
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.input.is_empty() {
                return Ok(0);
            }
            buf[0] = self.input.remove(0);
            Ok(1)
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<()> {
            self.written.extend_from_slice(buf);
            Ok(())
        }

        fn set_control_lines(&mut self, _dtr: bool, _rts: bool) -> io::Result<()> {
            Ok(())
        }
    }

    fn reply_frame(op: u8, value: u32, body: &[u8]) -> Vec<u8> {
        let mut packet = vec![0x01, op];
        packet.extend_from_slice(&(body.len() as u16).to_le_bytes());
        packet.extend_from_slice(&value.to_le_bytes());
        packet.extend_from_slice(body);
        slip::encode(&packet)
    }

    #[test]
    fn parses_register_value_from_reply() {
        let frame = reply_frame(0x0A, 0x00F0_1D83, &[0, 0]);
        let mut connection = Connection::new(Box::new(ScriptedTransport::new(&frame)));

        let value = connection.read_reg(0x4000_1000).unwrap();
        assert_eq!(value, 0x00F0_1D83);
    }

    #[test]
    fn discards_bytes_preceding_the_frame() {
        let mut input = vec![0xDE, 0xAD, 0xBE, 0xEF];
        input.extend(reply_frame(0x0A, 42, &[0, 0]));
        let mut connection = Connection::new(Box::new(ScriptedTransport::new(&input)));

        assert_eq!(connection.read_reg(0).unwrap(), 42);
    }

    #[test]
    fn nonzero_status_is_a_rom_error() {
        let frame = reply_frame(0x0A, 0, &[1, 0x05]);
        let mut connection = Connection::new(Box::new(ScriptedTransport::new(&frame)));

        let err = connection.read_reg(0).unwrap_err();
        assert!(matches!(err, Error::RomError(_)), "got {:?}", err);
    }

    #[test]
    fn times_out_when_no_frame_arrives() {
        let mut connection = Connection::new(Box::new(ScriptedTransport::new(&[])));

        let err = connection
            .command_with_timeout(Command::ReadReg { address: 0 }, Duration::from_millis(20))
            .unwrap_err();
        assert!(
            matches!(
                err,
                Error::Connection(ConnectionError::Timeout(_))
            ),
            "got {:?}",
            err
        );
    }

    #[test]
    fn short_frame_is_a_framing_error() {
        let short = slip::encode(&[0x01, 0x0A, 0x00]);
        let mut connection = Connection::new(Box::new(ScriptedTransport::new(&short)));

        let err = connection.read_reg(0).unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::FramingError)
        ));
    }

    #[test]
    fn strict_mode_rejects_mismatched_opcode() {
        let frame = reply_frame(0x08, 0, &[0, 0]);
        let mut connection = Connection::new(Box::new(ScriptedTransport::new(&frame)));
        connection.set_strict(true);

        let err = connection.read_reg(0).unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::MismatchedReply {
                sent: 0x0A,
                received: 0x08
            })
        ));
    }

    #[test]
    fn lenient_mode_accepts_mismatched_opcode() {
        let frame = reply_frame(0x08, 7, &[0, 0]);
        let mut connection = Connection::new(Box::new(ScriptedTransport::new(&frame)));

        assert_eq!(connection.read_reg(0).unwrap(), 7);
    }
}
