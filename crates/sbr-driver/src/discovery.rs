// SPDX-License-Identifier: AGPL-3.0-only

//! Runtime slot discovery
//!
//! Walks every PCI function, keeps the bridges whose slot capabilities name a
//! physical slot, and derives the endpoint address below each one from its
//! secondary bus number. Nothing is hardcoded; a function that cannot be read
//! is skipped and discovery carries on.

use crate::access::{read_decoded, RegisterAccess};
use crate::error::{Result, SbrError};
use sbr_regs::codec;
use sbr_regs::regs::{HEADER_TYPE, SECONDARY_BUS, SLOT_CAPABILITIES};
use sbr_regs::BusAddress;
use std::collections::BTreeSet;

/// A physical slot found during discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRecord {
    /// Physical slot number from slot capabilities (never 0)
    pub slot: u16,

    /// Upstream bridge (root or switch downstream port)
    pub upstream: BusAddress,

    /// Function `00.0` on the bridge's secondary bus
    pub downstream: BusAddress,
}

/// Discovered slots, in discovery order, keyed by slot number
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotTable {
    records: Vec<SlotRecord>,
}

impl SlotTable {
    /// Build a table from records, dropping duplicate and zero slot numbers.
    pub fn from_records(records: impl IntoIterator<Item = SlotRecord>) -> Self {
        let mut table = Self::default();
        for record in records {
            table.insert(record);
        }
        table
    }

    fn insert(&mut self, record: SlotRecord) -> bool {
        if record.slot == 0 {
            return false;
        }
        if let Some(existing) = self.get(record.slot) {
            tracing::warn!(
                "Slot {} reported by both {} and {}; keeping {}",
                record.slot,
                existing.upstream,
                record.upstream,
                existing.upstream
            );
            return false;
        }
        self.records.push(record);
        true
    }

    /// Look up a slot by number
    pub fn get(&self, slot: u16) -> Option<&SlotRecord> {
        self.records.iter().find(|r| r.slot == slot)
    }

    /// Resolve operator-selected slot numbers, keeping their order.
    ///
    /// # Errors
    ///
    /// Returns `SbrError::DuplicateSelection` when a slot is named twice and
    /// `SbrError::Selection` for a slot that was not discovered, whichever
    /// comes first.
    pub fn select(&self, slots: &[u16]) -> Result<Vec<SlotRecord>> {
        let mut seen = BTreeSet::new();
        slots
            .iter()
            .map(|&slot| {
                if !seen.insert(slot) {
                    return Err(SbrError::DuplicateSelection { slot });
                }
                self.get(slot).copied().ok_or_else(|| SbrError::Selection {
                    slot,
                    available: self.slot_numbers(),
                })
            })
            .collect()
    }

    /// All records in discovery order
    pub fn records(&self) -> &[SlotRecord] {
        &self.records
    }

    /// Slot numbers in discovery order
    pub fn slot_numbers(&self) -> Vec<u16> {
        self.records.iter().map(|r| r.slot).collect()
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no slots were discovered
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Slot discovery over a register backend
#[derive(Debug)]
pub struct SlotDiscovery<'a, A: RegisterAccess + ?Sized> {
    access: &'a A,
}

impl<'a, A: RegisterAccess + ?Sized> SlotDiscovery<'a, A> {
    /// Discover through `access`
    pub const fn new(access: &'a A) -> Self {
        Self { access }
    }

    /// Enumerate every function the backend sees and discover slots among them.
    ///
    /// # Errors
    ///
    /// Returns `SbrError::Enumeration` if the function list is unavailable.
    /// Per-function failures are logged and skipped.
    pub fn discover(&self) -> Result<SlotTable> {
        let functions = self.access.enumerate()?;
        Ok(self.discover_among(&functions))
    }

    /// Discover slots among an explicit list of functions.
    pub fn discover_among(&self, functions: &[BusAddress]) -> SlotTable {
        tracing::info!(
            "Scanning {} PCI function(s) for slots via {}",
            functions.len(),
            self.access.backend_name()
        );

        let mut table = SlotTable::default();

        for address in functions {
            match self.inspect(address) {
                Ok(Some(record)) => {
                    tracing::debug!(
                        "Slot {} at {} (downstream {})",
                        record.slot,
                        record.upstream,
                        record.downstream
                    );
                    table.insert(record);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping {address}: {e}"),
            }
        }

        tracing::info!("Discovered {} slot(s): {:?}", table.len(), table.slot_numbers());
        table
    }

    /// Check one function; `None` if it is not a bridge or has no slot.
    fn inspect(&self, address: &BusAddress) -> Result<Option<SlotRecord>> {
        let is_bridge = read_decoded(
            self.access,
            address,
            HEADER_TYPE,
            codec::decode_header_is_bridge,
        )?;
        if !is_bridge {
            return Ok(None);
        }

        let slot = read_decoded(
            self.access,
            address,
            SLOT_CAPABILITIES,
            codec::decode_slot_capability,
        )?;
        if slot == 0 {
            return Ok(None);
        }

        let secondary_bus = read_decoded(
            self.access,
            address,
            SECONDARY_BUS,
            codec::decode_secondary_bus,
        )?;

        Ok(Some(SlotRecord {
            slot,
            upstream: *address,
            downstream: BusAddress::downstream_of(address, secondary_bus),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{SimulatedAccess, SimulatedSlot};
    use sbr_regs::LinkField;

    const LINK: LinkField = LinkField::new(4, 3);

    fn bridge(device: u8) -> BusAddress {
        BusAddress::new(0, device, 0)
    }

    #[test]
    fn keeps_bridges_with_physical_slots_in_order() {
        let sim = SimulatedAccess::new()
            .with_function(BusAddress::new(0, 0, 0))
            .with_slot(SimulatedSlot::new(bridge(0x1d), 7, 0x04, LINK))
            .with_slot(SimulatedSlot::new(bridge(0x1c), 3, 0x03, LINK));

        let table = SlotDiscovery::new(&sim).discover().unwrap();

        // Enumeration order (by address), not slot order
        assert_eq!(table.slot_numbers(), vec![3, 7]);
        let rec = table.get(7).unwrap();
        assert_eq!(rec.upstream, bridge(0x1d));
        assert_eq!(rec.downstream, BusAddress::new(0x04, 0, 0));
    }

    #[test]
    fn zero_slot_number_never_grows_table() {
        let base =
            SimulatedAccess::new().with_slot(SimulatedSlot::new(bridge(0x1c), 3, 0x03, LINK));
        let before = SlotDiscovery::new(&base).discover().unwrap().len();

        let with_empty = SimulatedAccess::new()
            .with_slot(SimulatedSlot::new(bridge(0x1c), 3, 0x03, LINK))
            .with_slot(SimulatedSlot::new(bridge(0x01), 0, 0x01, LINK));
        let after = SlotDiscovery::new(&with_empty).discover().unwrap().len();

        assert_eq!(before, 1);
        assert_eq!(after, before);
    }

    #[test]
    fn read_failure_skips_only_that_candidate() {
        let sim = SimulatedAccess::new()
            .with_slot(SimulatedSlot::new(bridge(0x1c), 3, 0x03, LINK))
            .with_slot(SimulatedSlot::new(bridge(0x1d), 5, 0x04, LINK));
        sim.fail_reads(bridge(0x1c), SLOT_CAPABILITIES);

        let table = SlotDiscovery::new(&sim).discover().unwrap();
        assert_eq!(table.slot_numbers(), vec![5]);
    }

    #[test]
    fn malformed_register_skips_candidate() {
        let sim = SimulatedAccess::new()
            .with_slot(SimulatedSlot::new(bridge(0x1c), 3, 0x03, LINK))
            .with_slot(SimulatedSlot::new(bridge(0x1d), 5, 0x04, LINK))
            .with_raw(bridge(0x1d), SECONDARY_BUS, "??");

        let table = SlotDiscovery::new(&sim).discover().unwrap();
        assert_eq!(table.slot_numbers(), vec![3]);
    }

    #[test]
    fn duplicate_slot_numbers_keep_first() {
        let first = SlotRecord {
            slot: 3,
            upstream: bridge(0x1c),
            downstream: BusAddress::new(3, 0, 0),
        };
        let second = SlotRecord {
            upstream: bridge(0x1d),
            ..first
        };
        let table = SlotTable::from_records([first, second]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(3).unwrap().upstream, bridge(0x1c));
    }

    #[test]
    fn selection_resolves_in_operator_order() {
        let table = SlotTable::from_records([
            SlotRecord {
                slot: 3,
                upstream: bridge(0x1c),
                downstream: BusAddress::new(3, 0, 0),
            },
            SlotRecord {
                slot: 5,
                upstream: bridge(0x1d),
                downstream: BusAddress::new(4, 0, 0),
            },
        ]);

        let picked = table.select(&[5, 3]).unwrap();
        assert_eq!(picked[0].slot, 5);
        assert_eq!(picked[1].slot, 3);

        match table.select(&[3, 9]) {
            Err(SbrError::Selection { slot, available }) => {
                assert_eq!(slot, 9);
                assert_eq!(available, vec![3, 5]);
            }
            other => panic!("expected selection error, got {other:?}"),
        }
    }

    #[test]
    fn repeated_slot_is_rejected() {
        let table = SlotTable::from_records([SlotRecord {
            slot: 3,
            upstream: bridge(0x1c),
            downstream: BusAddress::new(3, 0, 0),
        }]);

        assert!(matches!(
            table.select(&[3, 3]),
            Err(SbrError::DuplicateSelection { slot: 3 })
        ));
        // Reported before an unknown slot later in the list
        assert!(matches!(
            table.select(&[3, 3, 9]),
            Err(SbrError::DuplicateSelection { slot: 3 })
        ));
    }
}
