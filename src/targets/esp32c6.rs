use crate::targets::Target;

pub(crate) const CHIP_ID: u16 = 0x32C6;

pub(crate) const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0x0DA1_806F];

/// ESP32-C6 Target
pub struct Esp32c6;

impl Esp32c6 {
    /// Check if the magic value contains the specified value
    pub fn has_magic_value(value: u32) -> bool {
        CHIP_DETECT_MAGIC_VALUES.contains(&value)
    }
}

impl Target for Esp32c6 {
    fn chip_id(&self) -> u16 {
        CHIP_ID
    }
}
