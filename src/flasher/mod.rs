//! Write firmware images to a target device
//!
//! The [Flasher] struct drives a complete programming session: resetting the
//! chip into its bootloader, syncing, identifying the device, optionally
//! uploading a RAM stub, configuring the SPI flash, and streaming one or more
//! images into it with MD5 verification.
//!
//! A session owns its [Transport] exclusively from [Flasher::enter_bootloader]
//! until [Flasher::reset]; nothing else may write to the port in between.

use std::{io::Write, thread::sleep, time::Duration};

use flate2::{write::ZlibEncoder, Compression};
use log::{debug, info, warn};
use md5::{Digest, Md5};
use strum_macros::Display;

use self::stubs::{FlashStub, StubSet};
use crate::{
    command::{Command, CommandType},
    connection::{reset, CommandResponse, Connection},
    error::{ConnectionError, Error},
    targets::Chip,
    transport::Transport,
};

pub mod stubs;

/// Address of the register identifying the chip family.
const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;

/// Smallest erasable unit of SPI flash.
const FLASH_SECTOR_SIZE: usize = 0x1000;
/// Transfer block size of the ROM loaders.
const FLASH_WRITE_SIZE: usize = 0x400;
/// Transfer block size once the stub is running.
const STUB_FLASH_WRITE_SIZE: usize = 0x4000;
/// Largest block accepted by the MEM_DATA command.
const MAX_RAM_BLOCK_SIZE: usize = 0x1800;

/// Baud rate the ROM loaders start at.
const ROM_BAUD: u32 = 115_200;
/// Flash size assumed when the caller does not configure one.
const DEFAULT_FLASH_SIZE: u32 = 0x40_0000;

/// Time the chip needs to settle after the end-of-flash command.
const FLASH_END_SETTLE_DELAY: Duration = Duration::from_millis(200);

/// Progress update callbacks
pub trait ProgressCallbacks {
    /// Initialize some progress report
    fn init(&mut self, addr: u32, total: usize);
    /// Update some progress report
    fn update(&mut self, current: usize);
    /// Finish some progress report
    fn finish(&mut self);
}

/// The stub upload step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum StubPhase {
    Text,
    Data,
    Entry,
}

/// Connect to and flash a target device
pub struct Flasher {
    connection: Connection,
    /// Detected device family, populated on first use.
    chip: Option<Chip>,
    /// Stubs registered by the embedder, looked up after detection.
    stubs: StubSet,
    /// Whether the RAM stub has taken over from the ROM loader.
    stub_loaded: bool,
    /// Flash size reported to the chip via SPI_SET_PARAMS.
    flash_size: u32,
    /// Baud rate the transport currently runs at.
    baud: u32,
}

impl Flasher {
    /// Create a session over `transport`.
    ///
    /// The transport is assumed to be running at the ROM's default baud rate;
    /// use [Flasher::set_baud] if it was opened at another speed.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Flasher {
            connection: Connection::new(transport),
            chip: None,
            stubs: StubSet::new(),
            stub_loaded: false,
            flash_size: DEFAULT_FLASH_SIZE,
            baud: ROM_BAUD,
        }
    }

    /// Register the stubs available to [Flasher::load_stub].
    pub fn set_stubs(&mut self, stubs: StubSet) {
        self.stubs = stubs;
    }

    /// Register a stub for a single chip family.
    pub fn add_stub(&mut self, chip: Chip, stub: FlashStub) {
        self.stubs.insert(chip, stub);
    }

    /// Override the flash size reported to the chip (defaults to 4 MiB).
    pub fn set_flash_size(&mut self, size: u32) {
        self.flash_size = size;
    }

    /// Record the baud rate the transport is currently running at.
    pub fn set_baud(&mut self, baud: u32) {
        self.baud = baud;
    }

    /// Reject replies whose opcode does not echo the request.
    pub fn set_strict(&mut self, strict: bool) {
        self.connection.set_strict(strict);
    }

    /// The detected device family, if detection has run.
    pub fn chip(&self) -> Option<Chip> {
        self.chip
    }

    /// Whether the RAM stub is running.
    pub fn uses_stub(&self) -> bool {
        self.stub_loaded
    }

    /// Reset into the bootloader, sync, and identify the device.
    pub fn connect(&mut self) -> Result<Chip, Error> {
        self.enter_bootloader()?;
        self.sync()?;
        self.detect_chip()
    }

    /// Reset the chip into its serial bootloader.
    pub fn enter_bootloader(&mut self) -> Result<(), Error> {
        self.chip = None;
        self.stub_loaded = false;
        reset::enter_bootloader(self.connection.transport_mut())
    }

    /// Reset the chip and let it run the user application.
    pub fn reset(&mut self) -> Result<(), Error> {
        reset::reset_to_run(self.connection.transport_mut())
    }

    /// Sync with the bootloader.
    pub fn sync(&mut self) -> Result<(), Error> {
        self.connection.sync()
    }

    /// Identify the connected device from its magic register.
    pub fn detect_chip(&mut self) -> Result<Chip, Error> {
        let magic = self.connection.read_reg(CHIP_DETECT_MAGIC_REG_ADDR)?;
        let chip = Chip::from_magic(magic)?;
        info!("Detected chip: {}", chip);

        self.chip = Some(chip);
        Ok(chip)
    }

    /// Upload and start the RAM stub for the detected chip.
    ///
    /// Returns `Ok(false)`, leaving the session on ROM commands, when no stub
    /// exists for the family or none was registered. A failure partway
    /// through the upload is an error, but the caller may still continue the
    /// session in ROM-only mode.
    pub fn load_stub(&mut self) -> Result<bool, Error> {
        let chip = self.target_chip()?;

        if !chip.into_target().has_flash_stub() {
            debug!("No flash stub exists for the {}, staying on ROM commands", chip);
            return Ok(false);
        }

        let stub = match self.stubs.get(chip) {
            Some(stub) => stub.clone(),
            None => {
                debug!("No stub registered for the {}, staying on ROM commands", chip);
                return Ok(false);
            }
        };

        info!("Uploading flash stub for the {}", chip);

        let (text_start, text) = stub.text();
        debug!("Writing {} byte stub text segment", text.len());
        self.write_ram_segment(text_start, text)
            .map_err(|err| stub_failure(StubPhase::Text, err))?;

        let (data_start, data) = stub.data();
        debug!("Writing {} byte stub data segment", data.len());
        self.write_ram_segment(data_start, data)
            .map_err(|err| stub_failure(StubPhase::Data, err))?;

        self.connection
            .command(Command::MemEnd {
                entry: stub.entry(),
            })
            .map_err(|err| stub_failure(StubPhase::Entry, err))?;

        self.stub_loaded = true;
        info!("Flash stub running");

        Ok(true)
    }

    /// Attach the SPI flash and configure its parameters.
    pub fn init(&mut self) -> Result<(), Error> {
        let chip = self.target_chip()?;

        if !self.stub_loaded {
            debug!("Attaching SPI flash");
            if chip == Chip::Esp8266 {
                // The ESP8266 ROM predates SPI_ATTACH; an empty FLASH_BEGIN
                // enables the flash instead.
                self.connection.command(Command::FlashBegin {
                    size: 0,
                    blocks: 0,
                    block_size: FLASH_WRITE_SIZE as u32,
                    offset: 0,
                    supports_encryption: false,
                })?;
            } else {
                self.connection.command(Command::SpiAttach)?;
            }
        }

        debug!("Configuring flash size to {} B", self.flash_size);
        self.connection.command(Command::SpiSetParams {
            size: self.flash_size,
        })?;

        Ok(())
    }

    /// Ask the chip to switch to a new baud rate.
    ///
    /// Only the chip side changes here: once this returns, reconfigure the
    /// transport to `new_baud` before issuing the next command. No-op on the
    /// ESP8266, whose loader cannot retune.
    pub fn change_baud_rate(&mut self, new_baud: u32) -> Result<(), Error> {
        let chip = self.target_chip()?;

        if !chip.into_target().supports_change_baudrate() {
            debug!("The {} cannot change baud rate, staying at {}", chip, self.baud);
            return Ok(());
        }

        // The stub needs to know the rate it is currently running at in
        // order to retune; the ROM loader takes a zero.
        let prior_baud = if self.stub_loaded { self.baud } else { 0 };

        self.connection.command(Command::ChangeBaudrate {
            new_baud,
            prior_baud,
        })?;

        self.baud = new_baud;
        info!("Baud rate changed, reconfigure the transport to {}", new_baud);

        Ok(())
    }

    /// Write an uncompressed image to flash at `offset`.
    pub fn flash_data(
        &mut self,
        image: &[u8],
        offset: u32,
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let chip = self.target_chip()?;

        info!("Writing {} bytes at {:#010x}", image.len(), offset);
        self.flash_begin(image.len(), image.len(), offset, false)?;
        self.write_blocks(image, offset, false, &mut progress)?;

        if chip.into_target().supports_flash_md5() {
            self.verify_flash_contents(image, offset)?;
        }

        Ok(())
    }

    /// Compress an image with zlib and write it to flash at `offset`.
    ///
    /// The chip inflates the stream as it arrives, so the erase region and
    /// the MD5 verification both cover the uncompressed size.
    pub fn flash_compressed_data(
        &mut self,
        image: &[u8],
        offset: u32,
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let chip = self.target_chip()?;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(image)?;
        let compressed = encoder.finish()?;

        info!(
            "Writing {} bytes ({} compressed) at {:#010x}",
            image.len(),
            compressed.len(),
            offset
        );
        self.flash_begin(image.len(), compressed.len(), offset, true)?;
        self.write_blocks(&compressed, offset, true, &mut progress)?;

        if chip.into_target().supports_flash_md5() {
            self.verify_flash_contents(image, offset)?;
        }

        Ok(())
    }

    /// Leave flashing mode, keeping the chip in its loader.
    pub fn flash_finish(&mut self) -> Result<(), Error> {
        self.connection.command(Command::FlashEnd { reboot: false })?;
        sleep(FLASH_END_SETTLE_DELAY);
        Ok(())
    }

    /// Recover the underlying transport, ending the session.
    pub fn into_transport(self) -> Box<dyn Transport> {
        self.connection.into_transport()
    }

    fn target_chip(&mut self) -> Result<Chip, Error> {
        match self.chip {
            Some(chip) => Ok(chip),
            None => self.detect_chip(),
        }
    }

    fn flash_write_size(&self) -> usize {
        if self.stub_loaded {
            STUB_FLASH_WRITE_SIZE
        } else {
            FLASH_WRITE_SIZE
        }
    }

    /// Open a flash write, sizing the erase region and its timeout.
    fn flash_begin(
        &mut self,
        image_len: usize,
        write_len: usize,
        offset: u32,
        compressed: bool,
    ) -> Result<(), Error> {
        let target = self.target_chip()?.into_target();
        let block_size = self.flash_write_size();
        let blocks = write_len.div_ceil(block_size) as u32;

        // The stub erases lazily while blocks arrive; the ROM loaders erase
        // the whole region up front and need a budget for it.
        let (size, timeout) = if self.stub_loaded {
            (image_len as u32, CommandType::FlashBegin.timeout())
        } else {
            let erase_size = (image_len.div_ceil(FLASH_SECTOR_SIZE) * FLASH_SECTOR_SIZE) as u32;
            (
                erase_size,
                CommandType::FlashBegin.timeout_for_size(erase_size),
            )
        };

        let command = if compressed {
            Command::FlashDeflBegin {
                size,
                blocks,
                block_size: block_size as u32,
                offset,
                supports_encryption: target.supports_encrypted_flash(),
            }
        } else {
            Command::FlashBegin {
                size,
                blocks,
                block_size: block_size as u32,
                offset,
                supports_encryption: target.supports_encrypted_flash(),
            }
        };

        self.connection.command_with_timeout(command, timeout)?;
        Ok(())
    }

    /// Stream `payload` as numbered blocks, retrying each at most once.
    ///
    /// Uncompressed blocks are padded to the full block size with 0xFF (the
    /// erased state of NOR flash); a compressed tail goes out at its natural
    /// length, since padding would corrupt the deflate stream.
    fn write_blocks(
        &mut self,
        payload: &[u8],
        offset: u32,
        compressed: bool,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let block_size = self.flash_write_size();
        let chunks = payload.chunks(block_size);
        let total = chunks.len();

        if let Some(cb) = progress.as_mut() {
            cb.init(offset, total);
        }

        for (sequence, block) in chunks.enumerate() {
            let command = if compressed {
                Command::FlashDeflData {
                    data: block,
                    sequence: sequence as u32,
                }
            } else {
                Command::FlashData {
                    data: block,
                    pad_to: block_size,
                    pad_byte: 0xFF,
                    sequence: sequence as u32,
                }
            };

            if let Err(err) = self.connection.command(command) {
                if matches!(err, Error::Connection(ConnectionError::Transport(_))) {
                    return Err(err);
                }
                warn!("Writing block {} failed ({}), retrying", sequence, err);
                self.connection.command(command)?;
            }

            if let Some(cb) = progress.as_mut() {
                cb.update(sequence + 1);
            }
        }

        if let Some(cb) = progress.as_mut() {
            cb.finish();
        }

        Ok(())
    }

    /// Compare the chip's MD5 digest over `offset..offset + len` with ours.
    fn verify_flash_contents(&mut self, image: &[u8], offset: u32) -> Result<(), Error> {
        let local: [u8; 16] = Md5::digest(image).into();

        let response = self.connection.command(Command::FlashMd5 {
            offset,
            size: image.len() as u32,
        })?;
        let device = digest_from_response(&response)?;

        if device != local {
            return Err(Error::VerifyFailed { offset });
        }

        debug!("Flash contents verified against MD5 digest");
        Ok(())
    }

    /// Upload one stub segment with MEM_BEGIN / MEM_DATA.
    fn write_ram_segment(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        let blocks = data.len().div_ceil(MAX_RAM_BLOCK_SIZE);

        self.connection.command(Command::MemBegin {
            size: data.len() as u32,
            blocks: blocks as u32,
            block_size: MAX_RAM_BLOCK_SIZE as u32,
            offset: addr,
        })?;

        for (sequence, block) in data.chunks(MAX_RAM_BLOCK_SIZE).enumerate() {
            self.connection.command(Command::MemData {
                data: block,
                sequence: sequence as u32,
            })?;
        }

        Ok(())
    }
}

fn stub_failure(phase: StubPhase, source: Error) -> Error {
    Error::StubLoadFailed {
        phase,
        source: Box::new(source),
    }
}

/// Pull the digest out of an MD5 reply.
///
/// The stub answers with the 16 raw digest bytes and a two byte status tail;
/// the ROM loaders render the digest as 32 ASCII hex characters followed by a
/// four byte tail. The body length tells the two apart.
fn digest_from_response(response: &CommandResponse) -> Result<[u8; 16], Error> {
    let body = &response.data;

    if body.len() >= 36 {
        let text = std::str::from_utf8(&body[..32])
            .map_err(|_| Error::Connection(ConnectionError::FramingError))?;
        let value = u128::from_str_radix(text, 16)
            .map_err(|_| Error::Connection(ConnectionError::FramingError))?;
        Ok(value.to_be_bytes())
    } else if body.len() >= 18 {
        Ok(body[..16].try_into().unwrap())
    } else {
        Err(Error::Connection(ConnectionError::FramingError))
    }
}
