//! Register access backends
//!
//! Three backends available:
//! - **setpci**: pciutils `lspci`/`setpci`, writes through `sudo -S`
//! - **sysfs**: positioned I/O on `/sys/bus/pci/devices/*/config`
//! - **simulated**: in-memory bridges and endpoints, no hardware required

pub mod setpci;
pub mod simulated;
pub mod sysfs;

pub use setpci::SetpciAccess;
pub use simulated::{RecordedWrite, SimulatedAccess, SimulatedSlot};
pub use sysfs::SysfsAccess;

use crate::access::RegisterAccess;
use std::fmt;
use std::str::FromStr;

/// Backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendSelection {
    /// pciutils command-line tools
    Setpci,
    /// sysfs config files
    Sysfs,
    /// Simulated topology ([`SimulatedAccess::demo`])
    Simulated,
}

impl fmt::Display for BackendSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setpci => write!(f, "setpci"),
            Self::Sysfs => write!(f, "sysfs"),
            Self::Simulated => write!(f, "sim"),
        }
    }
}

impl FromStr for BackendSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "setpci" | "pciutils" => Ok(Self::Setpci),
            "sysfs" => Ok(Self::Sysfs),
            "sim" | "simulated" => Ok(Self::Simulated),
            other => Err(format!("unknown backend {other:?} (setpci, sysfs, sim)")),
        }
    }
}

/// Build the selected backend
pub fn select_backend(selection: BackendSelection) -> Box<dyn RegisterAccess> {
    match selection {
        BackendSelection::Setpci => Box::new(SetpciAccess::new()),
        BackendSelection::Sysfs => {
            if !sysfs::available() {
                tracing::warn!("/sys/bus/pci/devices not present; sysfs backend will find nothing");
            }
            Box::new(SysfsAccess::new())
        }
        BackendSelection::Simulated => {
            tracing::info!("Using simulated PCIe topology");
            Box::new(SimulatedAccess::demo())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_parse() {
        assert_eq!("setpci".parse(), Ok(BackendSelection::Setpci));
        assert_eq!(" SYSFS ".parse(), Ok(BackendSelection::Sysfs));
        assert_eq!("sim".parse(), Ok(BackendSelection::Simulated));
        assert!("vfio".parse::<BackendSelection>().is_err());
        assert_eq!(BackendSelection::Simulated.to_string(), "sim");
    }

    #[test]
    fn selected_backend_reports_its_name() {
        assert_eq!(select_backend(BackendSelection::Simulated).backend_name(), "simulated");
        assert_eq!(select_backend(BackendSelection::Setpci).backend_name(), "setpci");
    }
}
