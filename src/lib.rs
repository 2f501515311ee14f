//! A library for programming the SPI flash of Espressif devices over serial
//!
//! This crate speaks the ROM bootloader protocol of the ESP8266 and the ESP32
//! family: SLIP-framed commands over a serial byte stream. A session resets
//! the chip into its bootloader, syncs, identifies the device from its magic
//! register, optionally uploads a RAM-resident flash stub, and then streams
//! firmware images into SPI flash, raw or zlib-compressed, verifying each
//! one against an MD5 digest computed by the chip.
//!
//! ```no_run
//! use esploader::{flasher::Flasher, transport::SerialTransport};
//!
//! # fn main() -> Result<(), esploader::Error> {
//! let port = serialport::new("/dev/ttyUSB0", 115_200)
//!     .timeout(std::time::Duration::from_millis(10))
//!     .open()
//!     .unwrap();
//!
//! let mut flasher = Flasher::new(Box::new(SerialTransport::new(port)));
//! flasher.connect()?;
//! flasher.load_stub()?;
//! flasher.init()?;
//! flasher.flash_compressed_data(&[0xE9, 0x02, 0x02, 0x00], 0x1_0000, None)?;
//! flasher.flash_finish()?;
//! flasher.reset()?;
//! # Ok(())
//! # }
//! ```
//!
//! Serial port discovery, firmware file handling, and progress rendering are
//! left to the embedding application; the driver only consumes a [Transport]
//! and, optionally, per-chip stub descriptors.
//!
//! [Transport]: transport::Transport

pub mod command;
pub mod connection;
pub mod error;
pub mod flasher;
pub mod slip;
pub mod targets;
pub mod transport;

pub use self::{error::Error, flasher::Flasher, targets::Chip};
