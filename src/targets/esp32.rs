use crate::targets::Target;

pub(crate) const CHIP_ID: u16 = 0x32;

pub(crate) const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0x00F0_1D83];

/// ESP32 Target
pub struct Esp32;

impl Esp32 {
    /// Check if the magic value contains the specified value
    pub fn has_magic_value(value: u32) -> bool {
        CHIP_DETECT_MAGIC_VALUES.contains(&value)
    }
}

impl Target for Esp32 {
    fn chip_id(&self) -> u16 {
        CHIP_ID
    }

    fn supports_encrypted_flash(&self) -> bool {
        false
    }
}
