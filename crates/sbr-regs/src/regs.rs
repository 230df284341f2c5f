//! Configuration-space register map used by the retrain harness.
//!
//! Offsets are either absolute within the type 1 (bridge) header or relative
//! to the PCI Express capability structure, which is what `setpci` calls
//! `CAP_EXP`.
//!
//! ```text
//! 0x0E.w            header type        (low nibble 1 = PCI-to-PCI bridge)
//! 0x19.b            secondary bus number
//! 0x3E.w            bridge control
//! CAP_EXP+0x0C.l    link capabilities
//! CAP_EXP+0x12.w    link status
//! CAP_EXP+0x14.l    slot capabilities
//! ```

use std::fmt;

/// Access width of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegisterWidth {
    /// 8 bit (`.b`)
    Byte,
    /// 16 bit (`.w`)
    Word,
    /// 32 bit (`.l`)
    Long,
}

impl RegisterWidth {
    /// Size in bytes.
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Long => 4,
        }
    }

    /// Number of hex digits in a zero-padded dump of this width.
    #[must_use]
    pub const fn hex_digits(self) -> usize {
        self.bytes() * 2
    }

    /// Largest value a register of this width can hold.
    #[must_use]
    pub const fn max_value(self) -> u32 {
        match self {
            Self::Byte => 0xFF,
            Self::Word => 0xFFFF,
            Self::Long => u32::MAX,
        }
    }

    /// `setpci` width suffix.
    #[must_use]
    pub const fn suffix(self) -> char {
        match self {
            Self::Byte => 'b',
            Self::Word => 'w',
            Self::Long => 'l',
        }
    }
}

/// What a register offset is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegisterBase {
    /// Absolute offset into the configuration header
    Header,
    /// Offset from the start of the PCI Express capability structure
    PciExpress,
}

/// A register location: base, offset and width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegisterSpec {
    /// What `offset` is relative to
    pub base: RegisterBase,
    /// Byte offset
    pub offset: u16,
    /// Access width
    pub width: RegisterWidth,
}

impl RegisterSpec {
    /// A register at an absolute header offset.
    #[must_use]
    pub const fn header(offset: u16, width: RegisterWidth) -> Self {
        Self {
            base: RegisterBase::Header,
            offset,
            width,
        }
    }

    /// A register inside the PCI Express capability.
    #[must_use]
    pub const fn express(offset: u16, width: RegisterWidth) -> Self {
        Self {
            base: RegisterBase::PciExpress,
            offset,
            width,
        }
    }
}

/// Renders in `setpci` syntax, e.g. `3e.w` or `CAP_EXP+0x14.l`.
impl fmt::Display for RegisterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.base {
            RegisterBase::Header => write!(f, "{:02x}.{}", self.offset, self.width.suffix()),
            RegisterBase::PciExpress => {
                write!(f, "CAP_EXP+{:#04x}.{}", self.offset, self.width.suffix())
            }
        }
    }
}

// ── Type 1 header ────────────────────────────────────────────────────────────

/// Header type, read as a word so the dump ends in the layout nibble.
pub const HEADER_TYPE: RegisterSpec = RegisterSpec::header(0x0E, RegisterWidth::Word);

/// Secondary bus number of a bridge.
pub const SECONDARY_BUS: RegisterSpec = RegisterSpec::header(0x19, RegisterWidth::Byte);

/// Bridge control.
pub const BRIDGE_CONTROL: RegisterSpec = RegisterSpec::header(0x3E, RegisterWidth::Word);

/// Status register (bit 4: capabilities list present).
pub const STATUS: RegisterSpec = RegisterSpec::header(0x06, RegisterWidth::Word);

/// Capabilities pointer.
pub const CAPABILITIES_POINTER: RegisterSpec = RegisterSpec::header(0x34, RegisterWidth::Byte);

// ── PCI Express capability ───────────────────────────────────────────────────

/// Link capabilities (maximum width / speed).
pub const LINK_CAPABILITIES: RegisterSpec = RegisterSpec::express(0x0C, RegisterWidth::Long);

/// Link status (negotiated width / speed).
pub const LINK_STATUS: RegisterSpec = RegisterSpec::express(0x12, RegisterWidth::Word);

/// Slot capabilities (physical slot number in the top bits).
pub const SLOT_CAPABILITIES: RegisterSpec = RegisterSpec::express(0x14, RegisterWidth::Long);

/// Capability list walking.
pub mod capability {
    /// Status register bit: a capability list is present.
    pub const LIST_PRESENT: u32 = 1 << 4;
    /// Capability ID of the PCI Express capability.
    pub const ID_PCI_EXPRESS: u8 = 0x10;
    /// Pointers are dword aligned; the low two bits are reserved.
    pub const POINTER_MASK: u8 = 0xFC;
    /// Upper bound on list length, guards against pointer loops.
    pub const MAX_ENTRIES: usize = 48;
}

/// Header type register values.
pub mod header_type {
    /// Layout nibble of a PCI-to-PCI bridge.
    pub const BRIDGE: u32 = 0x1;
    /// The layout lives in the low nibble of the dumped word.
    pub const LAYOUT_MASK: u32 = 0xF;
}

/// Bridge control register bits.
pub mod bridge_control {
    /// Parity error response enable.
    pub const PARITY_ERROR_RESPONSE: u16 = 1 << 0;
    /// SERR# enable.
    pub const SERR_ENABLE: u16 = 1 << 1;
    /// Secondary bus reset. Holding it asserts reset on the link below.
    pub const SECONDARY_BUS_RESET: u16 = 1 << 6;

    /// Value written to force a retrain: reset asserted with error
    /// reporting left enabled.
    pub const RETRAIN_TRIGGER: u16 = SECONDARY_BUS_RESET | SERR_ENABLE | PARITY_ERROR_RESPONSE;
}
