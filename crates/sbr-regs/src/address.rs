//! PCI function addresses.
//!
//! `lspci` prints functions as `bb:dd.f` and sysfs names them
//! `dddd:bb:dd.f`. Both forms parse; the domain defaults to zero and is
//! only printed when it is not.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A PCI function address (`[domain:]bus:device.function`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BusAddress {
    /// PCI segment / domain (0 on almost every system)
    pub domain: u16,
    /// Bus number
    pub bus: u8,
    /// Device number (0..=31)
    pub device: u8,
    /// Function number (0..=7)
    pub function: u8,
}

/// Errors from parsing a [`BusAddress`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid PCI address {text:?}: {reason}")]
pub struct AddressParseError {
    /// Input that failed to parse
    pub text: String,
    /// What was wrong with it
    pub reason: &'static str,
}

impl BusAddress {
    /// Create an address in domain 0.
    #[must_use]
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            domain: 0,
            bus,
            device,
            function,
        }
    }

    /// Function `00.0` on the bus one hop below a bridge.
    ///
    /// `secondary_bus` is the value of the bridge's secondary bus number
    /// register; the domain is inherited from the bridge.
    #[must_use]
    pub const fn downstream_of(bridge: &Self, secondary_bus: u8) -> Self {
        Self {
            domain: bridge.domain,
            bus: secondary_bus,
            device: 0,
            function: 0,
        }
    }

    /// Directory name under `/sys/bus/pci/devices`.
    #[must_use]
    pub fn sysfs_name(&self) -> String {
        format!(
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.domain != 0 {
            write!(f, "{:04x}:", self.domain)?;
        }
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.device, self.function)
    }
}

impl FromStr for BusAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| AddressParseError {
            text: s.to_string(),
            reason,
        };

        let text = s.trim();
        let (prefix, function) = text.rsplit_once('.').ok_or_else(|| err("missing '.function'"))?;

        let mut parts = prefix.rsplit(':');
        let device = parts.next().ok_or_else(|| err("missing device"))?;
        let bus = parts.next().ok_or_else(|| err("missing bus"))?;
        let domain = parts.next();
        if parts.next().is_some() {
            return Err(err("too many ':' separators"));
        }

        let domain = match domain {
            Some(d) => u16::from_str_radix(d, 16).map_err(|_| err("bad domain"))?,
            None => 0,
        };
        let bus = u8::from_str_radix(bus, 16).map_err(|_| err("bad bus number"))?;
        let device = u8::from_str_radix(device, 16).map_err(|_| err("bad device number"))?;
        let function = u8::from_str_radix(function, 16).map_err(|_| err("bad function number"))?;

        if device > 0x1F {
            return Err(err("device number above 0x1f"));
        }
        if function > 7 {
            return Err(err("function number above 7"));
        }

        Ok(Self {
            domain,
            bus,
            device,
            function,
        })
    }
}
