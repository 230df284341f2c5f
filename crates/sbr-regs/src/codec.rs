//! Register word decoding.
//!
//! Register values arrive as hex text (`setpci` output, or the same format
//! produced by the sysfs backend). Text is parsed into a 32-bit word first;
//! malformed or empty text is a [`DecodeError`], never a silent zero.
//!
//! Link capability and link status use different field widths:
//!
//! | Register | width | speed |
//! |----------|-------|-------|
//! | capability | bits 2..0 (3 bit) | bits 8..4 (5 bit) |
//! | status | bits 3..0 (4 bit) | bits 9..4 (6 bit) |
//!
//! Both layouts are kept exactly as they are, they are not interchangeable.

use crate::regs::{bridge_control, header_type, RegisterWidth};
use std::fmt;
use std::num::{IntErrorKind, ParseIntError};
use thiserror::Error;

/// Errors from decoding register text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Register text was empty
    #[error("empty register value")]
    Empty,

    /// Register text was not hexadecimal
    #[error("invalid register value {text:?}: {source}")]
    InvalidHex {
        /// Offending text
        text: String,
        /// Parser error
        source: ParseIntError,
    },

    /// Value does not fit the register it was read from
    #[error("register value {text:?} does not fit in {bits} bits")]
    OutOfRange {
        /// Offending text
        text: String,
        /// Register width in bits
        bits: usize,
    },
}

/// Link width and speed, either as capability or as negotiated status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkField {
    /// Width field
    pub width: u8,
    /// Speed field (generation code)
    pub speed: u8,
}

impl LinkField {
    /// Build a field from raw width and speed values.
    #[must_use]
    pub const fn new(width: u8, speed: u8) -> Self {
        Self { width, speed }
    }

    /// Decode a link capabilities word: width `[2:0]`, speed `[8:4]`.
    #[must_use]
    pub const fn from_capability_word(word: u32) -> Self {
        Self {
            width: (word & 0x7) as u8,
            speed: ((word >> 4) & 0x1F) as u8,
        }
    }

    /// Decode a link status word: width `[3:0]`, speed `[9:4]`.
    #[must_use]
    pub const fn from_status_word(word: u32) -> Self {
        Self {
            width: (word & 0xF) as u8,
            speed: ((word >> 4) & 0x3F) as u8,
        }
    }

    /// Encode into the link capabilities layout.
    ///
    /// Bits outside the capability fields are masked off.
    #[must_use]
    pub const fn to_capability_word(self) -> u32 {
        (self.width as u32 & 0x7) | ((self.speed as u32 & 0x1F) << 4)
    }

    /// Encode into the link status layout.
    ///
    /// Bits outside the status fields are masked off.
    #[must_use]
    pub const fn to_status_word(self) -> u16 {
        (self.width as u16 & 0xF) | ((self.speed as u16 & 0x3F) << 4)
    }
}

impl fmt::Display for LinkField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "width={} speed={}", self.width, self.speed)
    }
}

/// Parse register text into a word that fits `width`.
///
/// Accepts surrounding whitespace and an optional `0x` prefix.
///
/// # Errors
///
/// Returns [`DecodeError`] for empty, non-hex or oversized input.
pub fn parse_register(text: &str, width: RegisterWidth) -> Result<u32, DecodeError> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if digits.is_empty() {
        return Err(DecodeError::Empty);
    }

    let value = u32::from_str_radix(digits, 16).map_err(|source| {
        if matches!(source.kind(), IntErrorKind::PosOverflow) {
            DecodeError::OutOfRange {
                text: text.to_string(),
                bits: 32,
            }
        } else {
            DecodeError::InvalidHex {
                text: text.to_string(),
                source,
            }
        }
    })?;

    if value > width.max_value() {
        return Err(DecodeError::OutOfRange {
            text: text.to_string(),
            bits: width.bytes() * 8,
        });
    }

    Ok(value)
}

/// Format a value the way `setpci` dumps a register of `width`.
#[must_use]
pub fn format_register(value: u32, width: RegisterWidth) -> String {
    format!("{value:0digits$x}", digits = width.hex_digits())
}

/// Physical slot number: the top 13 bits (`[31:19]`) of slot capabilities.
///
/// Zero means no physical slot is implemented behind the port.
#[must_use]
pub const fn slot_number(word: u32) -> u16 {
    (word >> 19) as u16
}

/// Decode slot capabilities text into a slot number.
///
/// # Errors
///
/// Returns [`DecodeError`] if the text is not a 32-bit hex value.
pub fn decode_slot_capability(text: &str) -> Result<u16, DecodeError> {
    parse_register(text, RegisterWidth::Long).map(slot_number)
}

/// Decode link capabilities text.
///
/// # Errors
///
/// Returns [`DecodeError`] if the text is not a 32-bit hex value.
pub fn decode_link_capability(text: &str) -> Result<LinkField, DecodeError> {
    parse_register(text, RegisterWidth::Long).map(LinkField::from_capability_word)
}

/// Decode link status text.
///
/// The status register is 16 bits wide but decodes from the same 32-bit
/// space, so longer dumps are accepted and only the low fields are used.
///
/// # Errors
///
/// Returns [`DecodeError`] if the text is not a 32-bit hex value.
pub fn decode_link_status(text: &str) -> Result<LinkField, DecodeError> {
    parse_register(text, RegisterWidth::Long).map(LinkField::from_status_word)
}

/// Whether a header type dump describes a PCI-to-PCI bridge.
///
/// Only the low nibble is considered, so the multi-function bit and the BIST
/// byte in the upper half of the word are ignored.
#[must_use]
pub const fn is_bridge_header(word: u32) -> bool {
    word & header_type::LAYOUT_MASK == header_type::BRIDGE
}

/// Decode header type text.
///
/// # Errors
///
/// Returns [`DecodeError`] if the text is not a 16-bit hex value.
pub fn decode_header_is_bridge(text: &str) -> Result<bool, DecodeError> {
    parse_register(text, RegisterWidth::Word).map(is_bridge_header)
}

/// Decode the secondary bus number register.
///
/// # Errors
///
/// Returns [`DecodeError`] if the text is not an 8-bit hex value.
#[allow(clippy::cast_possible_truncation)] // range checked by parse_register
pub fn decode_secondary_bus(text: &str) -> Result<u8, DecodeError> {
    parse_register(text, RegisterWidth::Byte).map(|v| v as u8)
}

/// Decode the bridge control register.
///
/// # Errors
///
/// Returns [`DecodeError`] if the text is not a 16-bit hex value.
#[allow(clippy::cast_possible_truncation)] // range checked by parse_register
pub fn decode_bridge_control(text: &str) -> Result<u16, DecodeError> {
    parse_register(text, RegisterWidth::Word).map(|v| v as u16)
}

/// Whether a bridge control value holds the secondary bus in reset.
#[must_use]
pub const fn holds_secondary_reset(value: u16) -> bool {
    value & bridge_control::SECONDARY_BUS_RESET != 0
}
