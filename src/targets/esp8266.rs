use crate::targets::Target;

pub(crate) const CHIP_ID: u16 = 0x8266;

pub(crate) const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0xFFF0_C101];

/// ESP8266 Target
///
/// The oldest supported ROM: no flash stub, no baud-rate renegotiation, and
/// no MD5 command, so sessions run entirely on the original command set.
pub struct Esp8266;

impl Esp8266 {
    /// Check if the magic value contains the specified value
    pub fn has_magic_value(value: u32) -> bool {
        CHIP_DETECT_MAGIC_VALUES.contains(&value)
    }
}

impl Target for Esp8266 {
    fn chip_id(&self) -> u16 {
        CHIP_ID
    }

    fn supports_encrypted_flash(&self) -> bool {
        false
    }

    fn has_flash_stub(&self) -> bool {
        false
    }

    fn supports_flash_md5(&self) -> bool {
        false
    }

    fn supports_change_baudrate(&self) -> bool {
        false
    }
}
