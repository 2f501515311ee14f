use crate::targets::Target;

pub(crate) const CHIP_ID: u16 = 0x32C2;

pub(crate) const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0x6F51_306F];

/// ESP32-C2 Target
pub struct Esp32c2;

impl Esp32c2 {
    /// Check if the magic value contains the specified value
    pub fn has_magic_value(value: u32) -> bool {
        CHIP_DETECT_MAGIC_VALUES.contains(&value)
    }
}

impl Target for Esp32c2 {
    fn chip_id(&self) -> u16 {
        CHIP_ID
    }

    // No stub has been built for the C2; sessions stay on ROM commands.
    fn has_flash_stub(&self) -> bool {
        false
    }
}
