use crate::targets::Target;

pub(crate) const CHIP_ID: u16 = 0x32C3;

pub(crate) const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[
    0x6921_506F, // ECO1 + ECO2
    0x1B31_506F, // ECO3
];

/// ESP32-C3 Target
pub struct Esp32c3;

impl Esp32c3 {
    /// Check if the magic value contains the specified value
    pub fn has_magic_value(value: u32) -> bool {
        CHIP_DETECT_MAGIC_VALUES.contains(&value)
    }
}

impl Target for Esp32c3 {
    fn chip_id(&self) -> u16 {
        CHIP_ID
    }
}
