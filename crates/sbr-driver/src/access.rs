//! Register access abstraction
//!
//! Every backend (setpci, sysfs, simulated) exposes the same interface:
//! enumerate functions, read a register as zero-padded hex text, write a
//! register with an operator credential.

use crate::error::{Result, SbrError};
use sbr_regs::codec;
use sbr_regs::{BusAddress, RegisterSpec};
use std::fmt;

/// Configuration-space access for a set of PCI functions.
///
/// Reads return the register value as hex text, zero-padded to the register
/// width, the same form `setpci` prints. Decoding happens in
/// [`sbr_regs::codec`], never in the backend.
pub trait RegisterAccess: fmt::Debug {
    /// List every function the backend can see, in a stable order.
    ///
    /// # Errors
    ///
    /// Returns `SbrError::Enumeration` if the function list is unavailable.
    fn enumerate(&self) -> Result<Vec<BusAddress>>;

    /// Read a register.
    ///
    /// # Errors
    ///
    /// Returns `SbrError::RegisterRead` if the register cannot be read.
    fn read(&self, address: &BusAddress, register: RegisterSpec) -> Result<String>;

    /// Write a register using the privileged credential.
    ///
    /// # Errors
    ///
    /// Returns `SbrError::RegisterWrite` if the write is rejected.
    fn write(
        &self,
        address: &BusAddress,
        register: RegisterSpec,
        value: u32,
        credential: &Credential,
    ) -> Result<()>;

    /// Backend name for logs
    fn backend_name(&self) -> &'static str;
}

/// Read a register and decode it in one step.
///
/// # Errors
///
/// Returns `SbrError::RegisterRead` or `SbrError::Decode`.
pub fn read_decoded<A, T>(
    access: &A,
    address: &BusAddress,
    register: RegisterSpec,
    decode: impl FnOnce(&str) -> std::result::Result<T, codec::DecodeError>,
) -> Result<T>
where
    A: RegisterAccess + ?Sized,
{
    let text = access.read(address, register)?;
    decode(&text).map_err(|e| SbrError::decode(*address, register, e))
}

/// Privileged credential used for register writes.
///
/// Kept in memory only; `Debug` is redacted and nothing in this crate
/// writes it to a log.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential(Option<String>);

impl Credential {
    /// A sudo password.
    pub fn password(secret: impl Into<String>) -> Self {
        Self(Some(secret.into()))
    }

    /// No credential; writes run with the caller's own privileges.
    pub const fn none() -> Self {
        Self(None)
    }

    /// Whether a password was supplied
    pub const fn is_present(&self) -> bool {
        self.0.is_some()
    }

    /// Secret bytes, for piping into the privilege helper.
    pub(crate) fn expose(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("Credential(<redacted>)"),
            None => f.write_str("Credential(none)"),
        }
    }
}
