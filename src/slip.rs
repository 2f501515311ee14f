//! SLIP framing for the serial bootloader protocol
//!
//! Every packet exchanged with the ROM bootloader is wrapped in a SLIP frame:
//! a `0xC0` delimiter on either side, with `0xC0` and `0xDB` bytes inside the
//! frame replaced by two-byte escape sequences.
//!
//! See <https://docs.espressif.com/projects/esptool/en/latest/esp32/advanced-topics/serial-protocol.html#low-level-protocol>

/// SLIP end of frame token
pub const END: u8 = 0xC0;
/// SLIP escape token
const ESC: u8 = 0xDB;
/// SLIP escaped 0xC0 token
const ESC_END: u8 = 0xDC;
/// SLIP escaped 0xDB token
const ESC_ESC: u8 = 0xDD;

/// Wrap a packet in a SLIP frame, escaping any END and ESC bytes it contains.
pub fn encode(packet: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(packet.len() + 2);
    encoded.push(END);

    for byte in packet {
        match *byte {
            END => encoded.extend_from_slice(&[ESC, ESC_END]),
            ESC => encoded.extend_from_slice(&[ESC, ESC_ESC]),
            other => encoded.push(other),
        }
    }

    encoded.push(END);
    encoded
}

/// Undo the SLIP escaping applied to the interior of a frame.
///
/// The frame delimiters must already have been stripped. An escape token
/// followed by anything other than ESC_END/ESC_ESC is not valid SLIP; the ROM
/// never produces it, and in that case the following byte is passed through
/// unchanged rather than aborting the frame.
pub fn decode(frame: &[u8]) -> Vec<u8> {
    let mut decoded = Vec::with_capacity(frame.len());
    let mut escaped = false;

    for byte in frame {
        if escaped {
            match *byte {
                ESC_END => decoded.push(END),
                ESC_ESC => decoded.push(ESC),
                other => decoded.push(other),
            }
            escaped = false;
        } else if *byte == ESC {
            escaped = true;
        } else {
            decoded.push(*byte);
        }
    }

    decoded
}
