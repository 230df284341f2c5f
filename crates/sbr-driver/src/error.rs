//! Error types for link retrain testing

use sbr_regs::{BusAddress, DecodeError, LinkField, RegisterSpec};
use thiserror::Error;

/// Result type alias for retrain harness operations
pub type Result<T> = std::result::Result<T, SbrError>;

/// Errors that can occur while discovering slots or driving a retrain run
#[derive(Debug, Error)]
pub enum SbrError {
    /// Reading a configuration register failed
    #[error("Failed to read {register} on {address}: {reason}")]
    RegisterRead {
        /// Function that was read
        address: BusAddress,
        /// Register that was read
        register: RegisterSpec,
        /// Reason for failure
        reason: String,
    },

    /// Writing a configuration register failed
    #[error("Failed to write {register} on {address}: {reason}")]
    RegisterWrite {
        /// Function that was written
        address: BusAddress,
        /// Register that was written
        register: RegisterSpec,
        /// Reason for failure
        reason: String,
    },

    /// A register read back text that does not decode
    #[error("Malformed {register} value on {address}: {source}")]
    Decode {
        /// Function that was read
        address: BusAddress,
        /// Register that was read
        register: RegisterSpec,
        /// Underlying decode error
        source: DecodeError,
    },

    /// An operator-selected slot is not in the discovery table
    #[error("Slot {slot} was not discovered (available: {available:?})")]
    Selection {
        /// Requested slot number
        slot: u16,
        /// Slot numbers that were discovered
        available: Vec<u16>,
    },

    /// An operator-selected slot number appears more than once
    #[error("Slot {slot} selected more than once")]
    DuplicateSelection {
        /// Repeated slot number
        slot: u16,
    },

    /// Run parameters that cannot be executed
    #[error("Invalid run configuration: {reason}")]
    Config {
        /// What is wrong
        reason: String,
    },

    /// Negotiated link does not match its capabilities
    #[error(
        "Link mismatch on slot {slot} ({address}) at reset {iteration}: \
         status {observed}, capabilities {expected}"
    )]
    LinkMismatch {
        /// Slot number
        slot: u16,
        /// Downstream function whose status was read
        address: BusAddress,
        /// Loop iteration the mismatch was seen in
        iteration: u32,
        /// Decoded link status
        observed: LinkField,
        /// Decoded link capabilities from the snapshot
        expected: LinkField,
    },

    /// Training time could not be measured
    #[error("Train time probe failed for {address}: {reason}")]
    Probe {
        /// Upstream bridge that was probed
        address: BusAddress,
        /// Reason for failure
        reason: String,
    },

    /// The list of PCI functions could not be obtained
    #[error("Failed to enumerate PCI functions: {reason}")]
    Enumeration {
        /// Reason for failure
        reason: String,
    },

    /// I/O error (log file, child process plumbing)
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl SbrError {
    /// Create a register read error
    pub fn register_read(
        address: BusAddress,
        register: RegisterSpec,
        reason: impl Into<String>,
    ) -> Self {
        Self::RegisterRead {
            address,
            register,
            reason: reason.into(),
        }
    }

    /// Create a register write error
    pub fn register_write(
        address: BusAddress,
        register: RegisterSpec,
        reason: impl Into<String>,
    ) -> Self {
        Self::RegisterWrite {
            address,
            register,
            reason: reason.into(),
        }
    }

    /// Attach location to a decode error
    pub const fn decode(address: BusAddress, register: RegisterSpec, source: DecodeError) -> Self {
        Self::Decode {
            address,
            register,
            source,
        }
    }

    /// Create a probe error
    pub fn probe(address: BusAddress, reason: impl Into<String>) -> Self {
        Self::Probe {
            address,
            reason: reason.into(),
        }
    }

    /// Create an enumeration error
    pub fn enumeration(reason: impl Into<String>) -> Self {
        Self::Enumeration {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Whether this error should skip the current item rather than end the run
    pub const fn is_per_item(&self) -> bool {
        matches!(
            self,
            Self::RegisterRead { .. } | Self::RegisterWrite { .. } | Self::Decode { .. }
        )
    }
}
