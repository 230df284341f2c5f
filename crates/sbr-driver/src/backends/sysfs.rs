//! sysfs configuration-space backend
//!
//! Reads and writes `/sys/bus/pci/devices/<dddd:bb:dd.f>/config` with
//! positioned I/O. `CAP_EXP` offsets are resolved by walking the capability
//! list, so no pciutils are needed.
//!
//! Unprivileged processes only see the first 64 bytes of config space;
//! anything past that comes back as a short read. Writes need root (or
//! `CAP_SYS_ADMIN`), the credential is not used here.

use crate::access::{Credential, RegisterAccess};
use crate::error::{Result, SbrError};
use rustix::fs::{open, Mode, OFlags};
use rustix::io::{pread, pwrite};
use sbr_regs::codec::format_register;
use sbr_regs::regs::{capability, CAPABILITIES_POINTER, STATUS};
use sbr_regs::{BusAddress, RegisterBase, RegisterSpec};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Register access through sysfs `config` files
#[derive(Debug, Clone)]
pub struct SysfsAccess {
    root: PathBuf,
}

impl SysfsAccess {
    /// Use `/sys/bus/pci/devices`
    pub fn new() -> Self {
        Self::with_root("/sys/bus/pci/devices")
    }

    /// Use a different devices directory
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn config_path(&self, address: &BusAddress) -> PathBuf {
        self.root.join(address.sysfs_name()).join("config")
    }

    /// Read `len` little-endian bytes at an absolute offset.
    fn read_raw(&self, address: &BusAddress, offset: u16, len: usize) -> std::io::Result<u32> {
        let fd = open(
            self.config_path(address),
            OFlags::RDONLY | OFlags::CLOEXEC,
            Mode::empty(),
        )?;

        let mut buf = [0u8; 4];
        let got = pread(&fd, &mut buf[..len], u64::from(offset))?;
        if got != len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short read at {offset:#x} ({got} of {len} bytes, root required?)"),
            ));
        }

        Ok(u32::from_le_bytes(buf))
    }

    /// Offset of the PCI Express capability, walking the capability list.
    fn express_capability(&self, address: &BusAddress) -> std::io::Result<u16> {
        let not_found = || {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no PCI Express capability".to_string(),
            )
        };

        let status = self.read_raw(address, STATUS.offset, STATUS.width.bytes())?;
        if status & capability::LIST_PRESENT == 0 {
            return Err(not_found());
        }

        #[allow(clippy::cast_possible_truncation)] // byte-wide reads
        let mut pointer = self.read_raw(
            address,
            CAPABILITIES_POINTER.offset,
            CAPABILITIES_POINTER.width.bytes(),
        )? as u8
            & capability::POINTER_MASK;

        for _ in 0..capability::MAX_ENTRIES {
            if pointer == 0 {
                break;
            }
            let header = self.read_raw(address, u16::from(pointer), 2)?;
            #[allow(clippy::cast_possible_truncation)]
            let (id, next) = ((header & 0xFF) as u8, (header >> 8) as u8);
            trace!("{address}: capability {id:#04x} at {pointer:#04x}");
            if id == capability::ID_PCI_EXPRESS {
                return Ok(u16::from(pointer));
            }
            pointer = next & capability::POINTER_MASK;
        }

        Err(not_found())
    }

    fn resolve(&self, address: &BusAddress, register: RegisterSpec) -> std::io::Result<u16> {
        match register.base {
            RegisterBase::Header => Ok(register.offset),
            RegisterBase::PciExpress => {
                Ok(self.express_capability(address)? + register.offset)
            }
        }
    }
}

impl Default for SysfsAccess {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterAccess for SysfsAccess {
    fn enumerate(&self) -> Result<Vec<BusAddress>> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| {
            SbrError::enumeration(format!("cannot read {}: {e}", self.root.display()))
        })?;

        let mut addresses: Vec<BusAddress> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_string_lossy().parse().ok())
            .collect();

        // read_dir order is unspecified
        addresses.sort();

        debug!(
            "{} lists {} function(s)",
            self.root.display(),
            addresses.len()
        );
        Ok(addresses)
    }

    fn read(&self, address: &BusAddress, register: RegisterSpec) -> Result<String> {
        let value = self
            .resolve(address, register)
            .and_then(|offset| self.read_raw(address, offset, register.width.bytes()))
            .map_err(|e| SbrError::register_read(*address, register, e.to_string()))?;

        Ok(format_register(value, register.width))
    }

    fn write(
        &self,
        address: &BusAddress,
        register: RegisterSpec,
        value: u32,
        credential: &Credential,
    ) -> Result<()> {
        if credential.is_present() {
            debug!("sysfs backend writes with process privileges; credential unused");
        }

        let offset = self
            .resolve(address, register)
            .map_err(|e| SbrError::register_write(*address, register, e.to_string()))?;

        let bytes = value.to_le_bytes();
        let len = register.width.bytes();

        let written = open(
            self.config_path(address),
            OFlags::WRONLY | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .and_then(|fd| pwrite(&fd, &bytes[..len], u64::from(offset)))
        .map_err(|e| SbrError::register_write(*address, register, e.to_string()))?;

        if written != len {
            return Err(SbrError::register_write(
                *address,
                register,
                format!("short write ({written} of {len} bytes)"),
            ));
        }

        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sysfs"
    }
}

/// Whether the sysfs PCI tree exists on this system
pub fn available() -> bool {
    Path::new("/sys/bus/pci/devices").is_dir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbr_regs::regs::{
        BRIDGE_CONTROL, HEADER_TYPE, LINK_STATUS, SECONDARY_BUS, SLOT_CAPABILITIES,
    };

    /// 256-byte bridge config space with a PCIe capability at 0x40 behind a
    /// power management capability at 0x50.
    fn bridge_config() -> Vec<u8> {
        let mut cfg = vec![0u8; 256];
        cfg[0x06] = 0x10; // capability list present
        cfg[0x0E] = 0x01; // type 1 header
        cfg[0x19] = 0x03; // secondary bus
        cfg[0x3E] = 0x03; // bridge control
        cfg[0x34] = 0x50; // capabilities pointer
        cfg[0x50] = 0x01; // PM
        cfg[0x51] = 0x40;
        cfg[0x40] = 0x10; // PCIe
        cfg[0x41] = 0x00;
        cfg[0x40 + 0x12] = 0x34; // link status
        cfg[0x40 + 0x14..0x40 + 0x18].copy_from_slice(&0x0018_0000u32.to_le_bytes());
        cfg
    }

    fn fake_tree(config: &[u8]) -> (tempfile::TempDir, SysfsAccess) {
        let dir = tempfile::TempDir::new().unwrap();
        let dev = dir.path().join("0000:00:1c.0");
        std::fs::create_dir(&dev).unwrap();
        std::fs::write(dev.join("config"), config).unwrap();
        std::fs::create_dir(dir.path().join("not-a-device")).unwrap();
        let access = SysfsAccess::with_root(dir.path());
        (dir, access)
    }

    #[test]
    fn reads_header_registers() {
        let (_dir, access) = fake_tree(&bridge_config());
        let bridge = BusAddress::new(0, 0x1c, 0);

        assert_eq!(access.read(&bridge, HEADER_TYPE).unwrap(), "0001");
        assert_eq!(access.read(&bridge, SECONDARY_BUS).unwrap(), "03");
        assert_eq!(access.read(&bridge, BRIDGE_CONTROL).unwrap(), "0003");
    }

    #[test]
    fn walks_capability_list() {
        let (_dir, access) = fake_tree(&bridge_config());
        let bridge = BusAddress::new(0, 0x1c, 0);

        assert_eq!(access.read(&bridge, LINK_STATUS).unwrap(), "0034");
        assert_eq!(access.read(&bridge, SLOT_CAPABILITIES).unwrap(), "00180000");
    }

    #[test]
    fn missing_express_capability_is_read_error() {
        let mut cfg = bridge_config();
        cfg[0x06] = 0x00;
        let (_dir, access) = fake_tree(&cfg);

        let err = access
            .read(&BusAddress::new(0, 0x1c, 0), LINK_STATUS)
            .unwrap_err();
        assert!(matches!(err, SbrError::RegisterRead { .. }));
    }

    #[test]
    fn truncated_config_is_short_read() {
        // What an unprivileged reader sees
        let cfg = bridge_config();
        let (_dir, access) = fake_tree(&cfg[..64]);

        let bridge = BusAddress::new(0, 0x1c, 0);
        assert_eq!(access.read(&bridge, BRIDGE_CONTROL).unwrap(), "0003");
        assert!(access.read(&bridge, LINK_STATUS).is_err());
    }

    #[test]
    fn writes_bridge_control() {
        let (dir, access) = fake_tree(&bridge_config());
        let bridge = BusAddress::new(0, 0x1c, 0);

        access
            .write(&bridge, BRIDGE_CONTROL, 0x0043, &Credential::none())
            .unwrap();
        assert_eq!(access.read(&bridge, BRIDGE_CONTROL).unwrap(), "0043");

        let raw = std::fs::read(dir.path().join("0000:00:1c.0/config")).unwrap();
        assert_eq!(raw.len(), 256);
        assert_eq!(raw[0x3E], 0x43);
    }

    #[test]
    fn enumerates_only_device_directories() {
        let (_dir, access) = fake_tree(&bridge_config());
        assert_eq!(access.enumerate().unwrap(), vec![BusAddress::new(0, 0x1c, 0)]);
    }
}
