//! `setpci` / `lspci` backend
//!
//! Shells out to pciutils, the same tools an operator would use by hand.
//! Reads run unprivileged; writes go through `sudo -S` with the credential
//! piped on stdin, or run `setpci` directly when no credential is given.

use crate::access::{Credential, RegisterAccess};
use crate::error::{Result, SbrError};
use sbr_regs::codec::format_register;
use sbr_regs::{BusAddress, RegisterSpec};
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// Register access through the pciutils command-line tools
#[derive(Debug, Clone)]
pub struct SetpciAccess {
    lspci: String,
    setpci: String,
}

impl SetpciAccess {
    /// Use `lspci` and `setpci` from `PATH`
    pub fn new() -> Self {
        Self {
            lspci: "lspci".into(),
            setpci: "setpci".into(),
        }
    }

    /// Use explicit tool paths
    pub fn with_tools(lspci: impl Into<String>, setpci: impl Into<String>) -> Self {
        Self {
            lspci: lspci.into(),
            setpci: setpci.into(),
        }
    }
}

impl Default for SetpciAccess {
    fn default() -> Self {
        Self::new()
    }
}

/// Bus addresses from `lspci` output: the first token of every line.
///
/// Lines whose first token is not an address are skipped.
pub fn parse_lspci_listing(listing: &str) -> Vec<BusAddress> {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|token| match token.parse() {
            Ok(address) => Some(address),
            Err(e) => {
                warn!("Ignoring lspci line: {e}");
                None
            }
        })
        .collect()
}

impl RegisterAccess for SetpciAccess {
    fn enumerate(&self) -> Result<Vec<BusAddress>> {
        let output = Command::new(&self.lspci)
            .output()
            .map_err(|e| SbrError::enumeration(format!("cannot run {}: {e}", self.lspci)))?;

        if !output.status.success() {
            return Err(SbrError::enumeration(format!(
                "{} exited with {}: {}",
                self.lspci,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let addresses = parse_lspci_listing(&String::from_utf8_lossy(&output.stdout));
        debug!("lspci listed {} function(s)", addresses.len());
        Ok(addresses)
    }

    fn read(&self, address: &BusAddress, register: RegisterSpec) -> Result<String> {
        let output = Command::new(&self.setpci)
            .arg("-s")
            .arg(address.to_string())
            .arg(register.to_string())
            .output()
            .map_err(|e| {
                SbrError::register_read(*address, register, format!("cannot run setpci: {e}"))
            })?;

        if !output.status.success() {
            return Err(SbrError::register_read(
                *address,
                register,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn write(
        &self,
        address: &BusAddress,
        register: RegisterSpec,
        value: u32,
        credential: &Credential,
    ) -> Result<()> {
        let assignment = format!("{register}={}", format_register(value, register.width));
        debug!("setpci -s {address} {assignment}");

        let mut command = match credential.expose() {
            Some(_) => {
                let mut c = Command::new("sudo");
                c.args(["-S", "-p", ""]).arg(&self.setpci);
                c
            }
            None => Command::new(&self.setpci),
        };
        command
            .arg("-s")
            .arg(address.to_string())
            .arg(&assignment)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| {
                SbrError::register_write(*address, register, format!("cannot spawn: {e}"))
            })?;

        if let (Some(secret), Some(mut stdin)) = (credential.expose(), child.stdin.take()) {
            stdin
                .write_all(secret.as_bytes())
                .and_then(|()| stdin.write_all(b"\n"))
                .map_err(|e| {
                    SbrError::register_write(*address, register, format!("credential pipe: {e}"))
                })?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| SbrError::register_write(*address, register, e.to_string()))?;

        if !output.status.success() {
            return Err(SbrError::register_write(
                *address,
                register,
                format!(
                    "setpci exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "setpci"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lspci_first_column() {
        let listing = "\
00:00.0 Host bridge: Intel Corporation Device 9b33
00:1c.0 PCI bridge: Intel Corporation Device 06b8 (rev f0)
03:00.0 Non-Volatile memory controller: Samsung Electronics Co Ltd NVMe SSD

garbage line
";
        let addresses = parse_lspci_listing(listing);
        assert_eq!(
            addresses,
            vec![
                BusAddress::new(0x00, 0x00, 0),
                BusAddress::new(0x00, 0x1c, 0),
                BusAddress::new(0x03, 0x00, 0),
            ]
        );
    }

    #[test]
    fn missing_tool_is_enumeration_error() {
        let access = SetpciAccess::with_tools("/nonexistent/lspci", "/nonexistent/setpci");
        assert!(matches!(
            access.enumerate(),
            Err(SbrError::Enumeration { .. })
        ));
        assert!(matches!(
            access.read(&BusAddress::new(0, 0x1c, 0), sbr_regs::regs::HEADER_TYPE),
            Err(SbrError::RegisterRead { .. })
        ));
    }

    #[test]
    #[ignore] // Requires pciutils and PCI hardware
    fn test_enumerate_live_system() {
        let access = SetpciAccess::new();
        let functions = access.enumerate().unwrap();
        println!("lspci: {} function(s)", functions.len());
        assert!(!functions.is_empty());
    }
}
