//! Supported target devices
//!
//! Every ESP-family ROM exposes a magic value at a fixed address which
//! identifies the device family; reading it is the first thing a session does
//! after syncing. Families differ in a handful of protocol details: whether
//! their BEGIN commands take a trailing word, whether a flash stub exists for
//! them, and whether their ROM can compute an MD5 digest. Those quirks live
//! behind the [Target] trait, one implementation per family.

use strum_macros::{Display, EnumIter};

use crate::{
    targets::{
        esp32::Esp32, esp32c2::Esp32c2, esp32c3::Esp32c3, esp32c6::Esp32c6, esp32h2::Esp32h2,
        esp32s2::Esp32s2, esp32s3::Esp32s3, esp8266::Esp8266,
    },
    Error,
};

mod esp32;
mod esp32c2;
mod esp32c3;
mod esp32c6;
mod esp32h2;
mod esp32s2;
mod esp32s3;
mod esp8266;

/// All supported devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
pub enum Chip {
    /// ESP32
    Esp32,
    /// ESP32-C2, ESP8684
    Esp32c2,
    /// ESP32-C3, ESP8685
    Esp32c3,
    /// ESP32-C6
    Esp32c6,
    /// ESP32-H2
    Esp32h2,
    /// ESP32-S2
    Esp32s2,
    /// ESP32-S3
    Esp32s3,
    /// ESP8266
    Esp8266,
}

impl Chip {
    /// Identify a device from the magic value in its ROM.
    pub fn from_magic(magic: u32) -> Result<Self, Error> {
        if Esp32::has_magic_value(magic) {
            Ok(Chip::Esp32)
        } else if Esp32c2::has_magic_value(magic) {
            Ok(Chip::Esp32c2)
        } else if Esp32c3::has_magic_value(magic) {
            Ok(Chip::Esp32c3)
        } else if Esp32c6::has_magic_value(magic) {
            Ok(Chip::Esp32c6)
        } else if Esp32h2::has_magic_value(magic) {
            Ok(Chip::Esp32h2)
        } else if Esp32s2::has_magic_value(magic) {
            Ok(Chip::Esp32s2)
        } else if Esp32s3::has_magic_value(magic) {
            Ok(Chip::Esp32s3)
        } else if Esp8266::has_magic_value(magic) {
            Ok(Chip::Esp8266)
        } else {
            Err(Error::UnrecognizedChip(magic))
        }
    }

    pub fn into_target(self) -> Box<dyn Target> {
        match self {
            Chip::Esp32 => Box::new(Esp32),
            Chip::Esp32c2 => Box::new(Esp32c2),
            Chip::Esp32c3 => Box::new(Esp32c3),
            Chip::Esp32c6 => Box::new(Esp32c6),
            Chip::Esp32h2 => Box::new(Esp32h2),
            Chip::Esp32s2 => Box::new(Esp32s2),
            Chip::Esp32s3 => Box::new(Esp32s3),
            Chip::Esp8266 => Box::new(Esp8266),
        }
    }
}

/// Protocol properties of a target device family
pub trait Target {
    /// Stable numeric identifier for this family.
    fn chip_id(&self) -> u16;

    /// Do the BEGIN commands take the trailing `encrypted` word?
    fn supports_encrypted_flash(&self) -> bool {
        true
    }

    /// Does a RAM flash stub exist for this family?
    fn has_flash_stub(&self) -> bool {
        true
    }

    /// Can the loader compute an MD5 digest over flash?
    fn supports_flash_md5(&self) -> bool {
        true
    }

    /// Can the loader renegotiate the baud rate?
    fn supports_change_baudrate(&self) -> bool {
        true
    }
}
