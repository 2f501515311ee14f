//! Flash stub descriptors
//!
//! A stub ships as a small key-value document (TOML, converted from the JSON
//! used by `esptool.py`): an entry point plus base64-encoded text and data
//! segments with their load addresses. The blobs are built per chip family
//! and handed to the driver by the embedding application; nothing here knows
//! or cares what the machine code inside them does.

use std::collections::HashMap;

use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;

use crate::{
    error::{Error, StubParseError},
    targets::Chip,
};

/// On-disk form of a stub, with segments still base64-encoded.
#[derive(Debug, Clone, Deserialize)]
struct StubDescriptor {
    entry: u32,
    text: String,
    text_start: u32,
    data: String,
    data_start: u32,
}

/// A decoded RAM flash stub, ready to be uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashStub {
    entry: u32,
    text_start: u32,
    text: Vec<u8>,
    data_start: u32,
    data: Vec<u8>,
}

impl FlashStub {
    /// Decode a stub descriptor document.
    pub fn from_toml(document: &str) -> Result<Self, Error> {
        let descriptor: StubDescriptor = toml::from_str(document)
            .map_err(|e| Error::InvalidStubDescriptor(StubParseError::from(e)))?;

        let text = general_purpose::STANDARD
            .decode(&descriptor.text)
            .map_err(|e| Error::InvalidStubDescriptor(StubParseError::from(e)))?;
        let data = general_purpose::STANDARD
            .decode(&descriptor.data)
            .map_err(|e| Error::InvalidStubDescriptor(StubParseError::from(e)))?;

        Ok(FlashStub {
            entry: descriptor.entry,
            text_start: descriptor.text_start,
            text,
            data_start: descriptor.data_start,
            data,
        })
    }

    /// Entry point address
    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// Text segment load address and bytes
    pub fn text(&self) -> (u32, &[u8]) {
        (self.text_start, &self.text)
    }

    /// Data segment load address and bytes
    pub fn data(&self) -> (u32, &[u8]) {
        (self.data_start, &self.data)
    }
}

/// The stubs registered for a session, at most one per chip family.
#[derive(Debug, Default, Clone)]
pub struct StubSet {
    stubs: HashMap<Chip, FlashStub>,
}

impl StubSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `stub` for `chip`, replacing any previous one.
    pub fn insert(&mut self, chip: Chip, stub: FlashStub) {
        self.stubs.insert(chip, stub);
    }

    pub fn get(&self, chip: Chip) -> Option<&FlashStub> {
        self.stubs.get(&chip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &str = r#"
entry = 1074521560
text = "qAr0PxgA9D8AAPQ/pCv0Pw=="
text_start = 1074520064
data = "CAD0Pw=="
data_start = 1073605544
"#;

    #[test]
    fn decodes_descriptor_fields() {
        let stub = FlashStub::from_toml(DESCRIPTOR).unwrap();

        assert_eq!(stub.entry(), 1_074_521_560);

        let (text_start, text) = stub.text();
        assert_eq!(text_start, 1_074_520_064);
        assert_eq!(text.len(), 16);

        let (data_start, data) = stub.data();
        assert_eq!(data_start, 1_073_605_544);
        assert_eq!(data, &[0x08, 0x00, 0xF4, 0x3F]);
    }

    #[test]
    fn rejects_invalid_base64() {
        let document = DESCRIPTOR.replace("CAD0Pw==", "not base64!");
        let err = FlashStub::from_toml(&document).unwrap_err();
        assert!(matches!(err, Error::InvalidStubDescriptor(_)));
    }

    #[test]
    fn rejects_missing_fields() {
        let err = FlashStub::from_toml("entry = 1").unwrap_err();
        assert!(matches!(err, Error::InvalidStubDescriptor(_)));
    }

    #[test]
    fn stub_set_is_keyed_by_chip() {
        let stub = FlashStub::from_toml(DESCRIPTOR).unwrap();

        let mut stubs = StubSet::new();
        stubs.insert(Chip::Esp32, stub.clone());

        assert_eq!(stubs.get(Chip::Esp32), Some(&stub));
        assert!(stubs.get(Chip::Esp32s3).is_none());
    }
}
