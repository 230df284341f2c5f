// SPDX-License-Identifier: AGPL-3.0-only

//! One complete retrain test
//!
//! ```text
//! start log → discover → capture snapshot → probe train time → engine
//! ```
//!
//! Everything before the engine only reads registers, with the exception of
//! a probe that retrains a link to time it. A slot that was not discovered
//! is rejected before any write.

use crate::access::RegisterAccess;
use crate::clock::{CancelToken, Clock};
use crate::config::TestConfig;
use crate::discovery::{SlotDiscovery, SlotTable};
use crate::engine::{RetrainCycleEngine, RunReport};
use crate::error::Result;
use crate::probe::{max_train_time, TrainTimeProbe};
use crate::runlog::{ResultSink, RunLog};
use crate::snapshot::LinkCapabilitySnapshot;
use std::fmt::Display;
use std::time::Duration;
use tracing::{error, info};

/// Runs discovery, snapshot, probing and the retrain loop against one backend
#[derive(Debug)]
pub struct RetrainSession<'a, A: RegisterAccess + ?Sized, C: Clock + ?Sized> {
    access: &'a A,
    clock: &'a C,
    cancel: Option<CancelToken>,
    preamble: Vec<String>,
}

impl<'a, A: RegisterAccess + ?Sized, C: Clock + ?Sized> RetrainSession<'a, A, C> {
    /// Session over `access`, timing with `clock`
    pub const fn new(access: &'a A, clock: &'a C) -> Self {
        Self {
            access,
            clock,
            cancel: None,
            preamble: Vec::new(),
        }
    }

    /// Allow the operator to stop the loop
    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Lines logged right after the start time (system inventory)
    #[must_use]
    pub fn with_preamble(mut self, lines: Vec<String>) -> Self {
        self.preamble = lines;
        self
    }

    /// Run the whole test.
    ///
    /// The run log reaches `sink` exactly once, whether the run completes,
    /// aborts, or fails before the loop.
    ///
    /// # Errors
    ///
    /// Returns configuration, enumeration, selection, snapshot and probe
    /// failures, after flushing what was logged so far. A failed link check
    /// is not an error here; see [`RunReport::ensure_passed`].
    pub fn run_test(
        &self,
        config: &TestConfig,
        probe: &dyn TrainTimeProbe,
        sink: &mut dyn ResultSink,
    ) -> Result<RunReport> {
        let mut log = RunLog::started(self.clock.now());
        log.extend(self.preamble.iter().cloned());

        let (snapshot, wait) = match self.prepare(config, probe, &mut log) {
            Ok(prepared) => prepared,
            Err(e) => {
                error!("Run failed before the first reset: {e}");
                log.push(format!("Error: {e}"));
                if let Err(flush) = log.flush_to(sink) {
                    error!("Could not write run log: {flush}");
                }
                return Err(e);
            }
        };

        let mut engine = RetrainCycleEngine::new(self.access, self.clock);
        if let Some(token) = &self.cancel {
            engine = engine.with_cancel(token.clone());
        }
        engine.run(config, &snapshot, wait, log, sink)
    }

    /// Discovery, snapshot and wait; logs as it goes.
    fn prepare(
        &self,
        config: &TestConfig,
        probe: &dyn TrainTimeProbe,
        log: &mut RunLog,
    ) -> Result<(LinkCapabilitySnapshot, Duration)> {
        // Measuring train time may retrain a link, so reject bad parameters first
        config.iterations()?;

        let table = SlotDiscovery::new(self.access).discover()?;
        log_table(&table, log);

        let snapshot = LinkCapabilitySnapshot::capture(self.access, &table, &config.slots)?;

        let upstreams: Vec<_> = snapshot.slots().iter().map(|s| s.record.upstream).collect();
        let wait = max_train_time(probe, &upstreams)?;
        info!("Shared train time {wait:?} over {} slot(s)", upstreams.len());
        log.push(format!("Train Time: {}s", wait.as_secs_f64()));

        Ok((snapshot, wait))
    }
}

fn log_table(table: &SlotTable, log: &mut RunLog) {
    let records = table.records();
    log.push(format!(
        "Tested BDFs: {}",
        bracketed(records.iter().map(|r| r.upstream))
    ));
    log.push(format!(
        "Downstream BDFs: {}",
        bracketed(records.iter().map(|r| r.downstream))
    ));
    log.push(format!(
        "Slot Numbers: {}",
        bracketed(records.iter().map(|r| r.slot))
    ));
}

/// `[a, b, c]`
fn bracketed<T: Display>(items: impl Iterator<Item = T>) -> String {
    let items: Vec<String> = items.map(|item| item.to_string()).collect();
    format!("[{}]", items.join(", "))
}
