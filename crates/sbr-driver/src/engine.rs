// SPDX-License-Identifier: AGPL-3.0-only

//! Retrain cycle engine
//!
//! Drives every selected slot through `2N + 1` iterations. Each iteration is
//! one of two phases:
//!
//! ```text
//! iteration   0        1        2        3   ...   2N
//! phase       Verify   Drive    Verify   Drive     Verify
//! writes      orig     0x0043   orig     0x0043    orig
//! checks      yes      no       yes      no        yes
//! ```
//!
//! Drive asserts secondary bus reset, Verify releases it by restoring the
//! slot's original bridge control and then compares the downstream link
//! status against the snapshot. Status is only meaningful once the link has
//! retrained after release, so Drive never checks. The run always ends on a
//! Verify, leaving every bridge as it was found.
//!
//! State machine: `Idle → Running → {Completed | Aborted}`.

use crate::access::{read_decoded, Credential, RegisterAccess};
use crate::clock::{format_timestamp, CancelToken, Clock};
use crate::config::{AbortPolicy, TestConfig};
use crate::error::{Result, SbrError};
use crate::runlog::{ResultSink, RunLog};
use crate::snapshot::{LinkCapabilitySnapshot, SlotSnapshot};
use sbr_regs::codec;
use sbr_regs::regs::{bridge_control, BRIDGE_CONTROL, LINK_STATUS};
use sbr_regs::{BusAddress, LinkField};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

/// One half of a retrain cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Assert the retrain trigger; no check
    Drive,
    /// Restore the original control value, then check link status
    Verify,
}

impl Phase {
    /// Phase of a loop iteration: even iterations verify, odd ones drive.
    pub const fn for_iteration(iteration: u32) -> Self {
        if iteration % 2 == 0 {
            Self::Verify
        } else {
            Self::Drive
        }
    }

    /// Bridge control value this phase writes for `slot`
    pub const fn control_value(self, slot: &SlotSnapshot) -> u16 {
        match self {
            Self::Drive => bridge_control::RETRAIN_TRIGGER,
            Self::Verify => slot.original_bridge_control,
        }
    }

    /// Whether link status is compared in this phase
    pub const fn checks_status(self) -> bool {
        matches!(self, Self::Verify)
    }
}

/// Why a run stopped early
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// A link mismatch with [`AbortPolicy::AbortOnMismatch`]
    LinkMismatch(LinkMismatch),
    /// The operator cancelled
    Cancelled,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinkMismatch(m) => write!(
                f,
                "link status mismatch on slot {} ({}) at reset {}",
                m.slot, m.address, m.iteration
            ),
            Self::Cancelled => write!(f, "cancelled by operator"),
        }
    }
}

/// Engine state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    /// Not started
    Idle,
    /// Loop in progress
    Running,
    /// Every iteration ran
    Completed,
    /// Stopped early
    Aborted(AbortReason),
}

impl EngineState {
    /// Whether the run is over
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted(_))
    }
}

/// A link that came back different from its capabilities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMismatch {
    /// Loop iteration
    pub iteration: u32,
    /// Slot number
    pub slot: u16,
    /// Downstream function whose status was read
    pub address: BusAddress,
    /// Decoded link status
    pub observed: LinkField,
    /// Downstream capability from the snapshot
    pub expected: LinkField,
    /// When it was seen
    pub at: OffsetDateTime,
}

impl LinkMismatch {
    /// Run log lines for this mismatch
    pub fn log_lines(&self) -> [String; 5] {
        [
            format!("Reset {}", self.iteration),
            format!(
                "Link status does not match capabilities for bus {}",
                self.address
            ),
            format!("Link Status: {}", self.observed),
            format!("Link Capabilities: {}", self.expected),
            format!("Error Time: {}", format_timestamp(self.at)),
        ]
    }
}

impl From<&LinkMismatch> for SbrError {
    fn from(m: &LinkMismatch) -> Self {
        Self::LinkMismatch {
            slot: m.slot,
            address: m.address,
            iteration: m.iteration,
            observed: m.observed,
            expected: m.expected,
        }
    }
}

/// Outcome of a run
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Terminal state
    pub state: EngineState,
    /// Everything that was logged
    pub log: RunLog,
    /// Bridge control writes attempted
    pub operations: u64,
    /// Operations planned
    pub total_operations: u64,
    /// Link status comparisons made
    pub checks: u64,
    /// Times each slot was exercised
    pub slot_counts: BTreeMap<u16, u32>,
    /// Every mismatch seen
    pub mismatches: Vec<LinkMismatch>,
    /// Rejected bridge control writes
    pub write_failures: u32,
    /// Link status reads that failed or did not decode
    pub read_failures: u32,
    /// Shared wait applied after every write
    pub wait: Duration,
}

impl RunReport {
    /// Completed with no mismatches
    pub fn passed(&self) -> bool {
        self.state == EngineState::Completed && self.mismatches.is_empty()
    }

    /// Turn a failed run into an error.
    ///
    /// # Errors
    ///
    /// Returns `SbrError::LinkMismatch` for the first mismatch.
    pub fn ensure_passed(&self) -> Result<()> {
        match self.mismatches.first() {
            Some(m) => Err(m.into()),
            None => Ok(()),
        }
    }
}

/// The retrain test state machine
#[derive(Debug)]
pub struct RetrainCycleEngine<'a, A: RegisterAccess + ?Sized, C: Clock + ?Sized> {
    access: &'a A,
    clock: &'a C,
    cancel: Option<CancelToken>,
    state: EngineState,
}

/// Counters for a run in progress
struct Progress {
    report: RunReport,
    credential: Credential,
    policy: AbortPolicy,
}

impl<'a, A: RegisterAccess + ?Sized, C: Clock + ?Sized> RetrainCycleEngine<'a, A, C> {
    /// Engine over `access`, timing with `clock`
    pub const fn new(access: &'a A, clock: &'a C) -> Self {
        Self {
            access,
            clock,
            cancel: None,
            state: EngineState::Idle,
        }
    }

    /// Check `token` before every Drive iteration
    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Current state
    pub const fn state(&self) -> &EngineState {
        &self.state
    }

    /// Run the loop.
    ///
    /// `log` is whatever has been recorded before the loop (start time,
    /// discovery). It is flushed to `sink` exactly once, when the run
    /// completes or aborts.
    ///
    /// Write failures and status read failures are logged and skipped; only a
    /// mismatch under [`AbortPolicy::AbortOnMismatch`] or cancellation stops
    /// the run early.
    ///
    /// # Errors
    ///
    /// Returns `SbrError::Config` for a loop count too large to run, and an
    /// I/O error if the sink cannot persist the log.
    pub fn run(
        &mut self,
        config: &TestConfig,
        snapshot: &LinkCapabilitySnapshot,
        wait: Duration,
        mut log: RunLog,
        sink: &mut dyn ResultSink,
    ) -> Result<RunReport> {
        let iterations = match config.iterations() {
            Ok(iterations) => iterations,
            Err(e) => {
                error!("{e}");
                log.push(format!("Error: {e}"));
                log.flush_to(sink)?;
                return Err(e);
            }
        };
        let total_operations = u64::from(iterations) * snapshot.len() as u64;

        let mut run = Progress {
            report: RunReport {
                state: EngineState::Running,
                log,
                operations: 0,
                total_operations,
                checks: 0,
                slot_counts: snapshot.slots().iter().map(|s| (s.record.slot, 0)).collect(),
                mismatches: Vec::new(),
                write_failures: 0,
                read_failures: 0,
                wait,
            },
            credential: config.credential.clone(),
            policy: config.abort_policy,
        };

        self.state = EngineState::Running;
        info!(
            "Retrain run: {} slot(s), {} iteration(s), wait {wait:?}, abort on mismatch: {}",
            snapshot.len(),
            iterations,
            config.abort_policy
        );

        let outcome = self.drive_loop(iterations, snapshot, wait, &mut run, sink);
        self.state = outcome.clone();
        run.report.state = outcome;

        let log = &mut run.report.log;
        let now = format_timestamp(self.clock.now());
        match &run.report.state {
            EngineState::Aborted(reason) => {
                error!("Run aborted: {reason}");
                log.push(format!("Aborted: {reason}"));
                log.push(format!("Abort Time: {now}"));
            }
            _ => {
                let counts: Vec<String> = run
                    .report
                    .slot_counts
                    .iter()
                    .map(|(slot, n)| format!("{slot}: {n}"))
                    .collect();
                log.push(format!("End Time: {now}"));
                log.push(format!("Slot Test Counts: {{{}}}", counts.join(", ")));
                log.push(format!(
                    "Summary: loops={} iterations={} slots={} checks={} mismatches={}",
                    config.loops,
                    iterations,
                    snapshot.len(),
                    run.report.checks,
                    run.report.mismatches.len()
                ));
                info!(
                    "Run completed: {} check(s), {} mismatch(es)",
                    run.report.checks,
                    run.report.mismatches.len()
                );
            }
        }

        run.report.log.flush_to(sink)?;
        Ok(run.report)
    }

    /// The iteration loop; returns the terminal state.
    fn drive_loop(
        &self,
        iterations: u32,
        snapshot: &LinkCapabilitySnapshot,
        wait: Duration,
        run: &mut Progress,
        sink: &mut dyn ResultSink,
    ) -> EngineState {
        for iteration in 0..iterations {
            let phase = Phase::for_iteration(iteration);

            // Every bridge holds its original value at the start of a Drive
            let cancelled = self.cancel.as_ref().is_some_and(CancelToken::is_cancelled);
            if phase == Phase::Drive && cancelled {
                warn!("Cancellation requested before reset {iteration}");
                return EngineState::Aborted(AbortReason::Cancelled);
            }

            for (index, slot) in snapshot.slots().iter().enumerate() {
                run.report.operations += 1;
                if let Some(count) = run.report.slot_counts.get_mut(&slot.record.slot) {
                    *count += 1;
                }
                sink.report_progress(run.report.operations, run.report.total_operations);

                self.write_control(iteration, slot, phase.control_value(slot), run);
                self.clock.wait(wait);

                if !phase.checks_status() {
                    continue;
                }

                if let Some(mismatch) = self.verify(iteration, slot, run) {
                    run.report.log.extend(mismatch.log_lines());
                    run.report.mismatches.push(mismatch.clone());

                    if run.policy == AbortPolicy::AbortOnMismatch {
                        // Slots after this one still hold the trigger from the last Drive
                        if iteration > 0 {
                            self.restore(iteration, &snapshot.slots()[index + 1..], run);
                        }
                        return EngineState::Aborted(AbortReason::LinkMismatch(mismatch));
                    }
                }
            }
        }

        EngineState::Completed
    }

    fn write_control(
        &self,
        iteration: u32,
        slot: &SlotSnapshot,
        value: u16,
        run: &mut Progress,
    ) -> bool {
        let bridge = &slot.record.upstream;
        debug!("Reset {iteration}: {bridge} bridge control <- {value:#06x}");

        match self
            .access
            .write(bridge, BRIDGE_CONTROL, u32::from(value), &run.credential)
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Reset {iteration}: {e}");
                run.report.write_failures += 1;
                run.report.log.push(format!("Reset {iteration}: {e}"));
                false
            }
        }
    }

    /// Release reset on `slots` without checking them.
    fn restore(&self, iteration: u32, slots: &[SlotSnapshot], run: &mut Progress) {
        for slot in slots {
            if self.write_control(iteration, slot, slot.original_bridge_control, run) {
                info!("Restored bridge control on {}", slot.record.upstream);
                run.report
                    .log
                    .push(format!("Restored bridge control on {}", slot.record.upstream));
            }
        }
    }

    /// Read and compare downstream status; `None` if it matches or could
    /// not be read.
    fn verify(
        &self,
        iteration: u32,
        slot: &SlotSnapshot,
        run: &mut Progress,
    ) -> Option<LinkMismatch> {
        let downstream = &slot.record.downstream;
        run.report.checks += 1;

        let status = read_decoded(
            self.access,
            downstream,
            LINK_STATUS,
            codec::decode_link_status,
        );
        let observed = match status {
            Ok(status) => status,
            Err(e) => {
                warn!("Reset {iteration}: {e}");
                run.report.read_failures += 1;
                run.report.log.push(format!("Reset {iteration}: {e}"));
                return None;
            }
        };

        if observed == slot.downstream {
            debug!("Reset {iteration}: slot {} link {observed} OK", slot.record.slot);
            return None;
        }

        warn!(
            "Reset {iteration}: slot {} ({downstream}) link {observed}, expected {}",
            slot.record.slot, slot.downstream
        );
        Some(LinkMismatch {
            iteration,
            slot: slot.record.slot,
            address: *downstream,
            observed,
            expected: slot.downstream,
            at: self.clock.now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{SimulatedAccess, SimulatedSlot};
    use crate::clock::ManualClock;
    use crate::discovery::SlotRecord;
    use crate::runlog::MemorySink;

    const LINK: LinkField = LinkField::new(4, 3);

    fn bridge() -> BusAddress {
        BusAddress::new(0, 0x1c, 0)
    }

    fn snapshot() -> LinkCapabilitySnapshot {
        LinkCapabilitySnapshot::from_slots(vec![SlotSnapshot {
            record: SlotRecord {
                slot: 3,
                upstream: bridge(),
                downstream: BusAddress::new(3, 0, 0),
            },
            original_bridge_control: 0x0003,
            upstream: LINK,
            downstream: LINK,
        }])
    }

    fn sim() -> SimulatedAccess {
        SimulatedAccess::new().with_slot(SimulatedSlot::new(bridge(), 3, 0x03, LINK))
    }

    #[test]
    fn phases_alternate_starting_with_verify() {
        assert_eq!(Phase::for_iteration(0), Phase::Verify);
        assert_eq!(Phase::for_iteration(1), Phase::Drive);
        assert_eq!(Phase::for_iteration(2), Phase::Verify);
        assert!(Phase::Verify.checks_status());
        assert!(!Phase::Drive.checks_status());

        let slot = snapshot().slots()[0];
        assert_eq!(Phase::Drive.control_value(&slot), 0x0043);
        assert_eq!(Phase::Verify.control_value(&slot), 0x0003);
    }

    #[test]
    fn write_sequence_ends_on_original_value() {
        let sim = sim();
        let clock = ManualClock::new();
        let mut sink = MemorySink::new();
        let mut engine = RetrainCycleEngine::new(&sim, &clock);
        assert_eq!(engine.state(), &EngineState::Idle);
        assert!(!engine.state().is_terminal());

        let report = engine
            .run(
                &TestConfig::new(vec![3], 2),
                &snapshot(),
                Duration::from_millis(10),
                RunLog::new(),
                &mut sink,
            )
            .unwrap();

        let values: Vec<u32> = sim.writes().iter().map(|w| w.value).collect();
        assert_eq!(values, vec![0x03, 0x43, 0x03, 0x43, 0x03]);
        assert_eq!(sim.bridge_control(&bridge()), Some(0x0003));
        assert_eq!(engine.state(), &EngineState::Completed);
        assert!(engine.state().is_terminal());
        assert!(report.passed());
        assert_eq!(clock.waits(), vec![Duration::from_millis(10); 5]);
    }

    #[test]
    fn write_failures_do_not_stop_the_run() {
        let sim = sim();
        sim.fail_writes(bridge());
        let clock = ManualClock::new();
        let mut sink = MemorySink::new();

        let report = RetrainCycleEngine::new(&sim, &clock)
            .run(
                &TestConfig::new(vec![3], 1),
                &snapshot(),
                Duration::ZERO,
                RunLog::new(),
                &mut sink,
            )
            .unwrap();

        assert_eq!(report.state, EngineState::Completed);
        assert_eq!(report.write_failures, 3);
        assert_eq!(report.operations, 3);
        assert_eq!(sink.flushes, 1);
    }

    #[test]
    fn status_read_failure_is_not_a_mismatch() {
        let sim = sim();
        sim.fail_reads(BusAddress::new(3, 0, 0), LINK_STATUS);
        let clock = ManualClock::new();
        let mut sink = MemorySink::new();
        let config = TestConfig::new(vec![3], 1).with_abort_policy(AbortPolicy::AbortOnMismatch);

        let report = RetrainCycleEngine::new(&sim, &clock)
            .run(&config, &snapshot(), Duration::ZERO, RunLog::new(), &mut sink)
            .unwrap();

        assert_eq!(report.state, EngineState::Completed);
        assert_eq!(report.read_failures, 2);
        assert!(report.mismatches.is_empty());
        assert!(report.ensure_passed().is_ok());
    }

    #[test]
    fn cancellation_stops_before_next_drive() {
        let sim = sim();
        let clock = ManualClock::new();
        let mut sink = MemorySink::new();
        let token = CancelToken::new();
        token.cancel();

        let mut engine = RetrainCycleEngine::new(&sim, &clock).with_cancel(token);
        let report = engine
            .run(
                &TestConfig::new(vec![3], 3),
                &snapshot(),
                Duration::ZERO,
                RunLog::new(),
                &mut sink,
            )
            .unwrap();

        // Iteration 0 (Verify) runs, iteration 1 (Drive) never starts
        assert_eq!(report.state, EngineState::Aborted(AbortReason::Cancelled));
        assert_eq!(report.operations, 1);
        assert_eq!(sim.bridge_control(&bridge()), Some(0x0003));
        assert_eq!(sink.flushes, 1);
        assert!(sink.lines.iter().any(|l| l == "Aborted: cancelled by operator"));
    }

    #[test]
    fn oversized_loop_count_fails_before_any_write() {
        let sim = sim();
        let clock = ManualClock::new();
        let mut sink = MemorySink::new();
        let mut engine = RetrainCycleEngine::new(&sim, &clock);

        let err = engine
            .run(
                &TestConfig::new(vec![3], 1 << 31),
                &snapshot(),
                Duration::ZERO,
                RunLog::new(),
                &mut sink,
            )
            .unwrap_err();

        assert!(matches!(err, SbrError::Config { .. }));
        assert!(sim.writes().is_empty());
        assert_eq!(engine.state(), &EngineState::Idle);
        assert_eq!(sink.flushes, 1);
        assert!(sink.lines[0].starts_with("Error: Invalid run configuration"));
    }
}
