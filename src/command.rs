//! Commands understood by the ROM bootloader and the flash stub
//!
//! Every request shares the same header: a zero direction byte, the opcode,
//! the little-endian payload length, and a 32-bit check word. The check word
//! carries an XOR checksum for the data-bearing commands and zero for
//! everything else.

use std::{io::Write, mem::size_of, time::Duration};

use bytemuck::{bytes_of, Pod, Zeroable};
use strum_macros::Display;

/// Initial state of the XOR checksum over data blocks.
pub(crate) const CHECKSUM_INIT: u8 = 0xEF;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);
const SHORT_CMD_TIMEOUT: Duration = Duration::from_millis(100);
const MEM_END_TIMEOUT: Duration = Duration::from_millis(50);
const ERASE_REGION_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT_PER_MB: Duration = Duration::from_millis(40);
const MD5_TIMEOUT_PER_MB: Duration = Duration::from_secs(8);

/// Fold `data` into the running XOR checksum.
pub(crate) fn checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= *byte;
    }

    checksum
}

/// Opcodes issued by this driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    ReadReg = 0x0A,
    SpiSetParams = 0x0B,
    SpiAttach = 0x0D,
    ChangeBaudrate = 0x0F,
    FlashDeflBegin = 0x10,
    FlashDeflData = 0x11,
    FlashMd5 = 0x13,
}

impl CommandType {
    /// Fixed reply deadline for this opcode.
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::Sync => SYNC_TIMEOUT,
            CommandType::FlashEnd | CommandType::ChangeBaudrate => SHORT_CMD_TIMEOUT,
            CommandType::MemEnd => MEM_END_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Reply deadline scaled by the amount of flash the chip has to touch.
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        fn scale(timeout_per_mb: Duration, size: u32) -> Duration {
            let mb = size as f64 / 1_000_000.0;
            std::cmp::max(
                DEFAULT_TIMEOUT,
                Duration::from_millis((timeout_per_mb.as_millis() as f64 * mb) as u64),
            )
        }

        match self {
            CommandType::FlashBegin | CommandType::FlashDeflBegin => {
                scale(ERASE_REGION_TIMEOUT_PER_MB, size)
            }
            CommandType::FlashData | CommandType::FlashDeflData => {
                scale(WRITE_TIMEOUT_PER_MB, size)
            }
            CommandType::FlashMd5 => scale(MD5_TIMEOUT_PER_MB, size),
            _ => self.timeout(),
        }
    }
}

/// A request to the bootloader, ready to be serialized onto the wire.
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub enum Command<'a> {
    FlashBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
    },
    FlashData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    FlashEnd {
        reboot: bool,
    },
    MemBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    MemData {
        data: &'a [u8],
        sequence: u32,
    },
    MemEnd {
        entry: u32,
    },
    Sync,
    ReadReg {
        address: u32,
    },
    SpiSetParams {
        size: u32,
    },
    SpiAttach,
    ChangeBaudrate {
        /// New baud rate
        new_baud: u32,
        /// Prior baud rate (`0` for the ROM loader)
        prior_baud: u32,
    },
    FlashDeflBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
    },
    FlashDeflData {
        data: &'a [u8],
        sequence: u32,
    },
    FlashMd5 {
        offset: u32,
        size: u32,
    },
}

impl Command<'_> {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::MemBegin { .. } => CommandType::MemBegin,
            Command::MemData { .. } => CommandType::MemData,
            Command::MemEnd { .. } => CommandType::MemEnd,
            Command::Sync => CommandType::Sync,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::SpiSetParams { .. } => CommandType::SpiSetParams,
            Command::SpiAttach => CommandType::SpiAttach,
            Command::ChangeBaudrate { .. } => CommandType::ChangeBaudrate,
            Command::FlashDeflBegin { .. } => CommandType::FlashDeflBegin,
            Command::FlashDeflData { .. } => CommandType::FlashDeflData,
            Command::FlashMd5 { .. } => CommandType::FlashMd5,
        }
    }

    /// Reply deadline for this command, accounting for its payload size.
    pub fn timeout(&self) -> Duration {
        match *self {
            Command::FlashData { data, pad_to, .. } => CommandType::FlashData
                .timeout_for_size(usize::max(data.len(), pad_to) as u32),
            Command::FlashDeflData { data, .. } => {
                CommandType::FlashDeflData.timeout_for_size(data.len() as u32)
            }
            Command::FlashMd5 { size, .. } => CommandType::FlashMd5.timeout_for_size(size),
            _ => self.command_type().timeout(),
        }
    }

    /// Serialize the full request packet, header included.
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&[0, self.command_type() as u8])?;
        match *self {
            Command::FlashBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            }
            | Command::FlashDeflBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            } => {
                begin_command(writer, size, blocks, block_size, offset, supports_encryption)?;
            }
            Command::FlashData {
                data,
                pad_to,
                pad_byte,
                sequence,
            } => {
                data_command(writer, data, pad_to, pad_byte, sequence)?;
            }
            Command::FlashEnd { reboot } => {
                // The ROM reads a 32-bit flag: zero reboots immediately,
                // anything else stays in the loader. A two byte marker
                // precedes it on the wire.
                let mut payload = vec![0x3C, 0x49];
                payload.extend_from_slice(&u32::from(!reboot).to_le_bytes());
                write_basic(writer, &payload, 0)?;
            }
            Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
            } => {
                begin_command(writer, size, blocks, block_size, offset, false)?;
            }
            Command::MemData { data, sequence } => {
                data_command(writer, data, 0, 0, sequence)?;
            }
            Command::FlashDeflData { data, sequence } => {
                data_command(writer, data, 0, 0, sequence)?;
            }
            Command::MemEnd { entry } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct EntryParams {
                    no_entry: u32,
                    entry: u32,
                }
                let params = EntryParams { no_entry: 0, entry };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::Sync => {
                write_basic(
                    writer,
                    &[
                        0x07, 0x07, 0x12, 0x20, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
                        0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
                        0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
                    ],
                    0,
                )?;
            }
            Command::ReadReg { address } => {
                write_basic(writer, &address.to_le_bytes(), 0)?;
            }
            Command::SpiSetParams { size } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct SpiParams {
                    id: u32,
                    total_size: u32,
                    block_size: u32,
                    sector_size: u32,
                    page_size: u32,
                    status_mask: u32,
                }
                let params = SpiParams {
                    id: 0,
                    total_size: size,
                    block_size: 0x1_0000,
                    sector_size: 0x1000,
                    page_size: 256,
                    status_mask: 0xFFFF,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::SpiAttach => {
                // Zero pin assignments select the fused default SPI flash
                // interface; the ROM loader takes a second zero word.
                write_basic(writer, &[0; 8], 0)?;
            }
            Command::ChangeBaudrate {
                new_baud,
                prior_baud,
            } => {
                let mut payload = [0; 8];
                payload[..4].copy_from_slice(&new_baud.to_le_bytes());
                payload[4..].copy_from_slice(&prior_baud.to_le_bytes());
                write_basic(writer, &payload, 0)?;
            }
            Command::FlashMd5 { offset, size } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct Md5Params {
                    offset: u32,
                    size: u32,
                    reserved0: u32,
                    reserved1: u32,
                }
                let params = Md5Params {
                    offset,
                    size,
                    reserved0: 0,
                    reserved1: 0,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
        };
        Ok(())
    }
}

fn write_basic<W: Write>(mut writer: W, data: &[u8], checksum: u32) -> std::io::Result<()> {
    writer.write_all(&(data.len() as u16).to_le_bytes())?;
    writer.write_all(&checksum.to_le_bytes())?;
    writer.write_all(data)?;
    Ok(())
}

fn begin_command<W: Write>(
    writer: W,
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
    supports_encryption: bool,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone)]
    #[repr(C)]
    struct BeginParams {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        encrypted: u32,
    }
    let params = BeginParams {
        size,
        blocks,
        block_size,
        offset,
        encrypted: 0,
    };

    let bytes = bytes_of(&params);
    let data = if !supports_encryption {
        // The ESP32 and ESP8266 loaders do not take the `encrypted` word, so
        // truncate the final 4 bytes of the slice where it resides.
        &bytes[..bytes.len() - 4]
    } else {
        bytes
    };
    write_basic(writer, data, 0)
}

fn data_command<W: Write>(
    mut writer: W,
    block_data: &[u8],
    pad_to: usize,
    pad_byte: u8,
    sequence: u32,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone)]
    #[repr(C)]
    struct BlockParams {
        size: u32,
        sequence: u32,
        dummy0: u32,
        dummy1: u32,
    }

    let pad_length = pad_to.saturating_sub(block_data.len());

    let params = BlockParams {
        size: (block_data.len() + pad_length) as u32,
        sequence,
        dummy0: 0,
        dummy1: 0,
    };

    let mut check = checksum(block_data, CHECKSUM_INIT);
    for _ in 0..pad_length {
        check = checksum(&[pad_byte], check);
    }

    let total_length = size_of::<BlockParams>() + block_data.len() + pad_length;
    writer.write_all(&(total_length as u16).to_le_bytes())?;
    writer.write_all(&u32::from(check).to_le_bytes())?;
    writer.write_all(bytes_of(&params))?;
    writer.write_all(block_data)?;
    for _ in 0..pad_length {
        writer.write_all(&[pad_byte])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(command: Command<'_>) -> Vec<u8> {
        let mut buffer = Vec::new();
        command.write(&mut buffer).unwrap();
        buffer
    }

    fn header_length(packet: &[u8]) -> u16 {
        u16::from_le_bytes([packet[2], packet[3]])
    }

    fn header_checksum(packet: &[u8]) -> u32 {
        u32::from_le_bytes(packet[4..8].try_into().unwrap())
    }

    #[test]
    fn read_reg_packet() {
        let packet = packet(Command::ReadReg {
            address: 0x4000_1000,
        });
        assert_eq!(
            packet,
            vec![0x00, 0x0A, 0x04, 0x00, 0, 0, 0, 0, 0x00, 0x10, 0x00, 0x40]
        );
    }

    #[test]
    fn sync_packet_payload() {
        let packet = packet(Command::Sync);
        assert_eq!(header_length(&packet), 36);
        assert_eq!(header_checksum(&packet), 0);
        assert_eq!(&packet[8..12], &[0x07, 0x07, 0x12, 0x20]);
        assert!(packet[12..].iter().all(|b| *b == 0x55));
        assert_eq!(packet[12..].len(), 32);
    }

    #[test]
    fn begin_packet_with_trailing_word() {
        let with = packet(Command::FlashBegin {
            size: 0x1000,
            blocks: 1,
            block_size: 0x400,
            offset: 0x1_0000,
            supports_encryption: true,
        });
        assert_eq!(header_length(&with), 20);
        assert_eq!(&with[24..28], &[0, 0, 0, 0]);

        let without = packet(Command::FlashBegin {
            size: 0x1000,
            blocks: 1,
            block_size: 0x400,
            offset: 0x1_0000,
            supports_encryption: false,
        });
        assert_eq!(header_length(&without), 16);
        assert_eq!(without.len(), 8 + 16);
    }

    #[test]
    fn data_packet_pads_and_checksums() {
        let block = [0xAAu8; 6];
        let packet = packet(Command::FlashData {
            data: &block,
            pad_to: 8,
            pad_byte: 0xFF,
            sequence: 3,
        });

        assert_eq!(header_length(&packet), 16 + 8);
        // Block size field counts the padding, the sequence rides beside it.
        assert_eq!(&packet[8..12], &8u32.to_le_bytes());
        assert_eq!(&packet[12..16], &3u32.to_le_bytes());
        assert_eq!(&packet[16..24], &[0; 8]);
        assert_eq!(&packet[24..30], &block);
        assert_eq!(&packet[30..32], &[0xFF, 0xFF]);

        let expected = packet[24..32].iter().fold(CHECKSUM_INIT, |acc, b| acc ^ b);
        assert_eq!(header_checksum(&packet), u32::from(expected));
    }

    #[test]
    fn mem_data_is_not_padded() {
        let block = [0x11u8, 0x22, 0x33];
        let packet = packet(Command::MemData {
            data: &block,
            sequence: 0,
        });
        assert_eq!(header_length(&packet), 16 + 3);
        assert_eq!(&packet[8..12], &3u32.to_le_bytes());
        let expected = block.iter().fold(CHECKSUM_INIT, |acc, b| acc ^ b);
        assert_eq!(header_checksum(&packet), u32::from(expected));
    }

    #[test]
    fn mem_end_packet() {
        let packet = packet(Command::MemEnd { entry: 0x4001_0000 });
        assert_eq!(header_length(&packet), 8);
        assert_eq!(header_checksum(&packet), 0);
        assert_eq!(&packet[8..12], &[0; 4]);
        assert_eq!(&packet[12..16], &0x4001_0000u32.to_le_bytes());
    }

    #[test]
    fn flash_end_stays_in_loader() {
        let packet = packet(Command::FlashEnd { reboot: false });
        assert_eq!(&packet[..2], &[0x00, 0x04]);
        assert_eq!(header_length(&packet), 6);
        assert_eq!(&packet[8..], &[0x3C, 0x49, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn spi_set_params_packet() {
        let packet = packet(Command::SpiSetParams { size: 0x40_0000 });
        assert_eq!(header_length(&packet), 24);
        let words: Vec<u32> = packet[8..]
            .chunks(4)
            .map(|w| u32::from_le_bytes(w.try_into().unwrap()))
            .collect();
        assert_eq!(words, vec![0, 0x40_0000, 0x1_0000, 0x1000, 256, 0xFFFF]);
    }

    #[test]
    fn change_baudrate_packet() {
        let packet = packet(Command::ChangeBaudrate {
            new_baud: 921_600,
            prior_baud: 115_200,
        });
        assert_eq!(header_length(&packet), 8);
        assert_eq!(header_checksum(&packet), 0);
        assert_eq!(&packet[8..12], &921_600u32.to_le_bytes());
        assert_eq!(&packet[12..16], &115_200u32.to_le_bytes());
    }

    #[test]
    fn block_write_timeout_has_a_floor() {
        let data = [0u8; 0x400];
        let command = Command::FlashData {
            data: &data,
            pad_to: 0x400,
            pad_byte: 0xFF,
            sequence: 0,
        };
        assert_eq!(command.timeout(), Duration::from_secs(3));
    }

    #[test]
    fn md5_timeout_scales_with_size() {
        assert_eq!(
            CommandType::FlashMd5.timeout_for_size(4_000_000),
            Duration::from_secs(32)
        );
    }
}
