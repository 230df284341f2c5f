//! PCIe configuration-space model for secondary bus reset testing.
//!
//! This crate has **no hardware access**. It is a pure model of the
//! registers the link retrain harness touches: where they live, how wide
//! they are, and how their raw words decode into slot numbers and link
//! fields.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`address`] | `bus:device.function` addresses and downstream derivation |
//! | [`regs`] | Register specs (offset, width, base) and bridge control bits |
//! | [`codec`] | Register text parsing, field decoders and encoders |
//!
//! # Bit layout
//!
//! ```text
//! Slot capabilities  (32 bit)  [31:19] physical slot number
//! Link capabilities  (32 bit)  [8:4] speed   [2:0] width
//! Link status        (16 bit)  [9:4] speed   [3:0] width
//! ```
//!
//! The capability and status layouts are deliberately *not* the same width.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod address;
pub mod codec;
pub mod regs;

pub use address::{AddressParseError, BusAddress};
pub use codec::{DecodeError, LinkField};
pub use regs::{RegisterBase, RegisterSpec, RegisterWidth};
