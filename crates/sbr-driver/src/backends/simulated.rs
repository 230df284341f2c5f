// SPDX-License-Identifier: AGPL-3.0-only

//! Simulated PCIe topology
//!
//! An in-memory set of bridges and downstream endpoints that behaves like
//! real hardware as far as the retrain harness can tell:
//!
//! - asserting secondary bus reset in bridge control drops the link below
//!   (link status reads zero)
//! - releasing it retrains the link, normally back to its trained status
//! - individual retrains can be scripted to come up degraded
//! - reads and writes can be made to fail per function/register
//!
//! Used for CI without hardware and for `--backend sim` dry runs.

use crate::access::{Credential, RegisterAccess};
use crate::error::{Result, SbrError};
use parking_lot::Mutex;
use sbr_regs::codec::{format_register, holds_secondary_reset};
use sbr_regs::regs::{
    BRIDGE_CONTROL, HEADER_TYPE, LINK_CAPABILITIES, LINK_STATUS, SECONDARY_BUS, SLOT_CAPABILITIES,
};
use sbr_regs::{BusAddress, LinkField, RegisterSpec};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

/// One hot-plug slot: a bridge with a single endpoint below it.
#[derive(Debug, Clone)]
pub struct SimulatedSlot {
    /// Upstream bridge address
    pub bridge: BusAddress,
    /// Physical slot number advertised in slot capabilities (0 = none)
    pub slot_number: u16,
    /// Bus number of the endpoint below the bridge
    pub secondary_bus: u8,
    /// Bridge control value at power-on
    pub bridge_control: u16,
    /// Bridge link capabilities
    pub upstream_capability: LinkField,
    /// Endpoint link capabilities
    pub downstream_capability: LinkField,
    /// Status the endpoint link trains to
    pub trained_status: LinkField,
}

impl SimulatedSlot {
    /// A slot whose link trains to its full capability.
    pub const fn new(
        bridge: BusAddress,
        slot_number: u16,
        secondary_bus: u8,
        link: LinkField,
    ) -> Self {
        Self {
            bridge,
            slot_number,
            secondary_bus,
            bridge_control: 0x0003,
            upstream_capability: link,
            downstream_capability: link,
            trained_status: link,
        }
    }

    /// Override the status the link trains to.
    #[must_use]
    pub const fn trains_to(mut self, status: LinkField) -> Self {
        self.trained_status = status;
        self
    }

    /// Override the power-on bridge control value.
    #[must_use]
    pub const fn with_bridge_control(mut self, value: u16) -> Self {
        self.bridge_control = value;
        self
    }

    /// Endpoint address below the bridge.
    pub const fn downstream(&self) -> BusAddress {
        BusAddress::downstream_of(&self.bridge, self.secondary_bus)
    }
}

/// A write that reached the simulated hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedWrite {
    /// Function written
    pub address: BusAddress,
    /// Register written
    pub register: RegisterSpec,
    /// Value written
    pub value: u32,
}

#[derive(Debug)]
struct LinkState {
    slot: SimulatedSlot,
    bridge_control: u16,
    status: Option<LinkField>,
    retrains: u32,
    scripted: BTreeMap<u32, LinkField>,
}

#[derive(Debug, Default)]
struct State {
    functions: BTreeSet<BusAddress>,
    raw: BTreeMap<(BusAddress, RegisterSpec), String>,
    links: BTreeMap<BusAddress, LinkState>,
    failing_reads: BTreeSet<(BusAddress, RegisterSpec)>,
    failing_writes: BTreeSet<BusAddress>,
    failing_attempts: BTreeSet<(BusAddress, u32)>,
    write_attempts: BTreeMap<BusAddress, u32>,
    writes: Vec<RecordedWrite>,
    reads: usize,
}

/// In-memory PCIe topology implementing [`RegisterAccess`]
#[derive(Debug, Default)]
pub struct SimulatedAccess {
    state: Mutex<State>,
}

impl SimulatedAccess {
    /// An empty topology
    pub fn new() -> Self {
        Self::default()
    }

    /// Two populated slots and a host bridge, for dry runs.
    pub fn demo() -> Self {
        let gen3_x4 = LinkField::new(4, 3);
        Self::new()
            .with_function(BusAddress::new(0x00, 0x00, 0))
            .with_slot(SimulatedSlot::new(BusAddress::new(0x00, 0x1c, 0), 3, 0x03, gen3_x4))
            .with_slot(SimulatedSlot::new(BusAddress::new(0x00, 0x1d, 0), 5, 0x04, gen3_x4))
    }

    /// Add a plain (non-bridge) function.
    #[must_use]
    pub fn with_function(self, address: BusAddress) -> Self {
        self.state.lock().functions.insert(address);
        self
    }

    /// Add a bridge and its endpoint.
    #[must_use]
    pub fn with_slot(self, slot: SimulatedSlot) -> Self {
        {
            let mut state = self.state.lock();
            state.functions.insert(slot.bridge);
            state.functions.insert(slot.downstream());
            state.links.insert(
                slot.bridge,
                LinkState {
                    bridge_control: slot.bridge_control,
                    status: Some(slot.trained_status),
                    retrains: 0,
                    scripted: BTreeMap::new(),
                    slot,
                },
            );
        }
        self
    }

    /// Override what a register reads back, verbatim.
    #[must_use]
    pub fn with_raw(
        self,
        address: BusAddress,
        register: RegisterSpec,
        text: impl Into<String>,
    ) -> Self {
        self.state.lock().raw.insert((address, register), text.into());
        self
    }

    /// Make the `retrain`-th retrain (1-based) of `bridge` come up at `status`.
    ///
    /// Later retrains return to the trained status.
    pub fn script_retrain(&self, bridge: BusAddress, retrain: u32, status: LinkField) {
        if let Some(link) = self.state.lock().links.get_mut(&bridge) {
            link.scripted.insert(retrain, status);
        }
    }

    /// Make every read of `register` on `address` fail.
    pub fn fail_reads(&self, address: BusAddress, register: RegisterSpec) {
        self.state.lock().failing_reads.insert((address, register));
    }

    /// Make every write to `address` fail.
    pub fn fail_writes(&self, address: BusAddress) {
        self.state.lock().failing_writes.insert(address);
    }

    /// Make only the `attempt`-th write (1-based) to `address` fail.
    ///
    /// Attempts are counted whether or not they succeed.
    pub fn fail_write_attempt(&self, address: BusAddress, attempt: u32) {
        self.state.lock().failing_attempts.insert((address, attempt));
    }

    /// Every write accepted so far, in order.
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state.lock().writes.clone()
    }

    /// Number of successful reads so far.
    pub fn read_count(&self) -> usize {
        self.state.lock().reads
    }

    /// Number of completed retrains on `bridge`.
    pub fn retrains(&self, bridge: &BusAddress) -> u32 {
        self.state
            .lock()
            .links
            .get(bridge)
            .map_or(0, |link| link.retrains)
    }

    /// Current bridge control value of `bridge`.
    pub fn bridge_control(&self, bridge: &BusAddress) -> Option<u16> {
        self.state.lock().links.get(bridge).map(|link| link.bridge_control)
    }
}

impl State {
    fn link_for_bridge(&self, address: &BusAddress) -> Option<&LinkState> {
        self.links.get(address)
    }

    fn link_for_endpoint(&self, address: &BusAddress) -> Option<&LinkState> {
        self.links.values().find(|l| l.slot.downstream() == *address)
    }

    fn value(&self, address: &BusAddress, register: RegisterSpec) -> Option<u32> {
        if let Some(link) = self.link_for_bridge(address) {
            return match register {
                r if r == HEADER_TYPE => Some(0x0001),
                r if r == SECONDARY_BUS => Some(u32::from(link.slot.secondary_bus)),
                r if r == BRIDGE_CONTROL => Some(u32::from(link.bridge_control)),
                r if r == SLOT_CAPABILITIES => Some(u32::from(link.slot.slot_number) << 19),
                r if r == LINK_CAPABILITIES => {
                    Some(link.slot.upstream_capability.to_capability_word())
                }
                r if r == LINK_STATUS => {
                    Some(u32::from(link.slot.upstream_capability.to_status_word()))
                }
                _ => None,
            };
        }

        if let Some(link) = self.link_for_endpoint(address) {
            return match register {
                r if r == HEADER_TYPE => Some(0x0000),
                r if r == LINK_CAPABILITIES => {
                    Some(link.slot.downstream_capability.to_capability_word())
                }
                r if r == LINK_STATUS => {
                    Some(u32::from(link.status.map_or(0, LinkField::to_status_word)))
                }
                _ => None,
            };
        }

        match register {
            r if r == HEADER_TYPE => Some(0x0000),
            _ => None,
        }
    }
}

impl RegisterAccess for SimulatedAccess {
    fn enumerate(&self) -> Result<Vec<BusAddress>> {
        Ok(self.state.lock().functions.iter().copied().collect())
    }

    fn read(&self, address: &BusAddress, register: RegisterSpec) -> Result<String> {
        let mut state = self.state.lock();

        if !state.functions.contains(address) {
            return Err(SbrError::register_read(*address, register, "no such device"));
        }
        if state.failing_reads.contains(&(*address, register)) {
            return Err(SbrError::register_read(*address, register, "injected read failure"));
        }

        let text = match state.raw.get(&(*address, register)) {
            Some(text) => text.clone(),
            None => {
                let value = state.value(address, register).ok_or_else(|| {
                    SbrError::register_read(*address, register, "register not implemented")
                })?;
                format_register(value, register.width)
            }
        };

        state.reads += 1;
        trace!("sim read {address} {register} = {text}");
        Ok(text)
    }

    fn write(
        &self,
        address: &BusAddress,
        register: RegisterSpec,
        value: u32,
        _credential: &Credential,
    ) -> Result<()> {
        let mut state = self.state.lock();

        let attempts = state.write_attempts.entry(*address).or_insert(0);
        *attempts += 1;
        let attempt = *attempts;
        if state.failing_writes.contains(address)
            || state.failing_attempts.contains(&(*address, attempt))
        {
            return Err(SbrError::register_write(*address, register, "injected write failure"));
        }
        if register != BRIDGE_CONTROL {
            return Err(SbrError::register_write(*address, register, "register is read-only"));
        }

        let link = state
            .links
            .get_mut(address)
            .ok_or_else(|| SbrError::register_write(*address, register, "not a bridge"))?;

        #[allow(clippy::cast_possible_truncation)] // bridge control is a word
        let new = value as u16;
        let was_reset = holds_secondary_reset(link.bridge_control);
        link.bridge_control = new;

        if holds_secondary_reset(new) {
            link.status = None;
        } else if was_reset {
            link.retrains += 1;
            let status = link
                .scripted
                .get(&link.retrains)
                .copied()
                .unwrap_or(link.slot.trained_status);
            debug!("sim retrain #{} on {address}: {status}", link.retrains);
            link.status = Some(status);
        }

        state.writes.push(RecordedWrite {
            address: *address,
            register,
            value,
        });
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> SimulatedSlot {
        SimulatedSlot::new(BusAddress::new(0, 0x1c, 0), 3, 0x03, LinkField::new(4, 3))
    }

    #[test]
    fn bridge_reads_like_hardware() {
        let sim = SimulatedAccess::new().with_slot(slot());
        let bridge = BusAddress::new(0, 0x1c, 0);

        assert_eq!(sim.read(&bridge, HEADER_TYPE).unwrap(), "0001");
        assert_eq!(sim.read(&bridge, SECONDARY_BUS).unwrap(), "03");
        assert_eq!(sim.read(&bridge, SLOT_CAPABILITIES).unwrap(), "00180000");
        assert_eq!(sim.read(&bridge, BRIDGE_CONTROL).unwrap(), "0003");
        assert_eq!(sim.read(&bridge, LINK_CAPABILITIES).unwrap(), "00000034");
    }

    #[test]
    fn reset_drops_and_release_retrains() {
        let sim = SimulatedAccess::new().with_slot(slot());
        let bridge = BusAddress::new(0, 0x1c, 0);
        let endpoint = BusAddress::new(0x03, 0, 0);
        let cred = Credential::none();

        assert_eq!(sim.read(&endpoint, LINK_STATUS).unwrap(), "0034");

        sim.write(&bridge, BRIDGE_CONTROL, 0x43, &cred).unwrap();
        assert_eq!(sim.read(&endpoint, LINK_STATUS).unwrap(), "0000");

        sim.write(&bridge, BRIDGE_CONTROL, 0x03, &cred).unwrap();
        assert_eq!(sim.read(&endpoint, LINK_STATUS).unwrap(), "0034");
        assert_eq!(sim.retrains(&bridge), 1);

        // Writing the original value again is not a retrain
        sim.write(&bridge, BRIDGE_CONTROL, 0x03, &cred).unwrap();
        assert_eq!(sim.retrains(&bridge), 1);
        assert_eq!(sim.writes().len(), 3);
    }

    #[test]
    fn scripted_retrain_degrades_once() {
        let sim = SimulatedAccess::new().with_slot(slot());
        let bridge = BusAddress::new(0, 0x1c, 0);
        let endpoint = BusAddress::new(0x03, 0, 0);
        let cred = Credential::none();
        sim.script_retrain(bridge, 1, LinkField::new(1, 3));

        sim.write(&bridge, BRIDGE_CONTROL, 0x43, &cred).unwrap();
        sim.write(&bridge, BRIDGE_CONTROL, 0x03, &cred).unwrap();
        assert_eq!(sim.read(&endpoint, LINK_STATUS).unwrap(), "0031");

        sim.write(&bridge, BRIDGE_CONTROL, 0x43, &cred).unwrap();
        sim.write(&bridge, BRIDGE_CONTROL, 0x03, &cred).unwrap();
        assert_eq!(sim.read(&endpoint, LINK_STATUS).unwrap(), "0034");
    }

    #[test]
    fn injected_failures() {
        let sim = SimulatedAccess::new().with_slot(slot());
        let bridge = BusAddress::new(0, 0x1c, 0);
        sim.fail_reads(bridge, SLOT_CAPABILITIES);
        sim.fail_writes(bridge);

        assert!(sim.read(&bridge, SLOT_CAPABILITIES).is_err());
        assert!(sim
            .write(&bridge, BRIDGE_CONTROL, 0x43, &Credential::none())
            .is_err());
        assert!(sim.writes().is_empty());

        // Failed reads are not counted
        assert_eq!(sim.read_count(), 0);
        sim.read(&bridge, SECONDARY_BUS).unwrap();
        assert_eq!(sim.read_count(), 1);
    }

    #[test]
    fn single_write_attempt_fails() {
        let sim = SimulatedAccess::new().with_slot(slot());
        let bridge = BusAddress::new(0, 0x1c, 0);
        let cred = Credential::none();
        sim.fail_write_attempt(bridge, 2);

        sim.write(&bridge, BRIDGE_CONTROL, 0x43, &cred).unwrap();
        assert!(sim.write(&bridge, BRIDGE_CONTROL, 0x03, &cred).is_err());
        assert_eq!(sim.bridge_control(&bridge), Some(0x0043));

        sim.write(&bridge, BRIDGE_CONTROL, 0x03, &cred).unwrap();
        assert_eq!(sim.retrains(&bridge), 1);
        assert_eq!(sim.writes().len(), 2);
    }

    #[test]
    fn unknown_function_fails_to_read() {
        let sim = SimulatedAccess::demo();
        assert!(sim.read(&BusAddress::new(0x7f, 0, 0), HEADER_TYPE).is_err());
        assert_eq!(sim.enumerate().unwrap().len(), 5);
    }
}
