// SPDX-License-Identifier: AGPL-3.0-only

//! Link capability snapshot
//!
//! Captured once per run before the first bridge control write. It is the
//! reference every post-retrain link status is compared against and is
//! never refreshed.

use crate::access::{read_decoded, RegisterAccess};
use crate::discovery::{SlotRecord, SlotTable};
use crate::error::Result;
use sbr_regs::codec;
use sbr_regs::regs::{BRIDGE_CONTROL, LINK_CAPABILITIES};
use sbr_regs::LinkField;

/// Ground truth for one selected slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSnapshot {
    /// The slot being exercised
    pub record: SlotRecord,

    /// Bridge control value before the run; written back on every check
    pub original_bridge_control: u16,

    /// Link capabilities of the upstream bridge
    pub upstream: LinkField,

    /// Link capabilities of the downstream endpoint
    pub downstream: LinkField,
}

/// Per-slot capabilities for every selected slot, in selection order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkCapabilitySnapshot {
    slots: Vec<SlotSnapshot>,
}

impl LinkCapabilitySnapshot {
    /// Resolve `selection` against `table` and read every slot's
    /// capabilities and original bridge control.
    ///
    /// Only reads; no register is written.
    ///
    /// # Errors
    ///
    /// Returns `SbrError::Selection` if a slot was not discovered, and any
    /// read or decode error, since a run cannot start without its reference.
    pub fn capture<A>(access: &A, table: &SlotTable, selection: &[u16]) -> Result<Self>
    where
        A: RegisterAccess + ?Sized,
    {
        let records = table.select(selection)?;

        let slots = records
            .into_iter()
            .map(|record| {
                let original_bridge_control = read_decoded(
                    access,
                    &record.upstream,
                    BRIDGE_CONTROL,
                    codec::decode_bridge_control,
                )?;
                let upstream = read_decoded(
                    access,
                    &record.upstream,
                    LINK_CAPABILITIES,
                    codec::decode_link_capability,
                )?;
                let downstream = read_decoded(
                    access,
                    &record.downstream,
                    LINK_CAPABILITIES,
                    codec::decode_link_capability,
                )?;

                tracing::info!(
                    "Slot {}: bridge control {original_bridge_control:#06x}, \
                     upstream {upstream}, downstream {downstream}",
                    record.slot
                );

                Ok(SlotSnapshot {
                    record,
                    original_bridge_control,
                    upstream,
                    downstream,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { slots })
    }

    /// Build a snapshot directly
    pub fn from_slots(slots: Vec<SlotSnapshot>) -> Self {
        Self { slots }
    }

    /// Slots in selection order
    pub fn slots(&self) -> &[SlotSnapshot] {
        &self.slots
    }

    /// Snapshot of one slot
    pub fn get(&self, slot: u16) -> Option<&SlotSnapshot> {
        self.slots.iter().find(|s| s.record.slot == slot)
    }

    /// Number of selected slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slot was selected
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{SimulatedAccess, SimulatedSlot};
    use crate::discovery::SlotDiscovery;
    use crate::error::SbrError;
    use sbr_regs::BusAddress;

    fn sim() -> SimulatedAccess {
        let mut slot =
            SimulatedSlot::new(BusAddress::new(0, 0x1c, 0), 3, 0x03, LinkField::new(4, 3))
                .with_bridge_control(0x0013);
        slot.upstream_capability = LinkField::new(7, 4);
        SimulatedAccess::new()
            .with_slot(slot)
            .with_slot(SimulatedSlot::new(
                BusAddress::new(0, 0x1d, 0),
                5,
                0x04,
                LinkField::new(1, 2),
            ))
    }

    #[test]
    fn captures_both_ends_in_selection_order() {
        let sim = sim();
        let table = SlotDiscovery::new(&sim).discover().unwrap();
        let snap = LinkCapabilitySnapshot::capture(&sim, &table, &[5, 3]).unwrap();

        assert_eq!(snap.len(), 2);
        assert_eq!(snap.slots()[0].record.slot, 5);

        let three = snap.get(3).unwrap();
        assert_eq!(three.original_bridge_control, 0x0013);
        assert_eq!(three.upstream, LinkField::new(7, 4));
        assert_eq!(three.downstream, LinkField::new(4, 3));
        assert!(sim.writes().is_empty());
    }

    #[test]
    fn unknown_slot_is_selection_error_without_writes() {
        let sim = sim();
        let table = SlotDiscovery::new(&sim).discover().unwrap();
        let err = LinkCapabilitySnapshot::capture(&sim, &table, &[3, 42]).unwrap_err();
        assert!(matches!(err, SbrError::Selection { slot: 42, .. }));
        assert!(sim.writes().is_empty());
    }

    #[test]
    fn malformed_capability_is_decode_error() {
        let sim = sim().with_raw(BusAddress::new(0x03, 0, 0), LINK_CAPABILITIES, "");
        let table = SlotDiscovery::new(&sim).discover().unwrap();
        let err = LinkCapabilitySnapshot::capture(&sim, &table, &[3]).unwrap_err();
        assert!(matches!(err, SbrError::Decode { .. }));
    }
}
