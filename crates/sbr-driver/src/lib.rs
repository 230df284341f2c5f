//! PCIe link retrain test harness.
//!
//! Finds the physical slots behind PCIe bridges, snapshots each link's
//! capabilities, then repeatedly asserts and releases secondary bus reset
//! on the selected slots and checks that every link comes back at the width
//! and speed it is capable of.
//!
//! # Layers
//!
//! ```text
//! RegisterAccess     setpci / sysfs / simulated backends
//!   SlotDiscovery    bridges with a physical slot number
//!   Snapshot         original bridge control + link capabilities
//!   TrainTimeProbe   one shared wait, the slowest slot's
//!   RetrainCycleEngine  Verify / Drive loop, RunLog, RunReport
//! ResultSink         output file, progress
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use sbr_driver::prelude::*;
//!
//! # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let access = SetpciAccess::new();
//! let config = TestConfig::new(vec![3, 5], 100)
//!     .with_abort_policy(AbortPolicy::AbortOnMismatch)
//!     .with_credential(Credential::password("..."));
//!
//! let mut sink = FileSink::new("output.txt");
//! let report = RetrainSession::new(&access, &SystemClock)
//!     .run_test(&config, &FixedProbe::from_secs_f64(1.0), &mut sink)?;
//! report.ensure_passed()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod access;
pub mod backends;
mod clock;
mod config;
mod discovery;
mod engine;
mod error;
pub mod inventory;
mod probe;
mod runlog;
mod session;
mod snapshot;

/// Register model (re-exported from sbr-regs).
pub mod regs {
    pub use sbr_regs::codec::{
        decode_bridge_control, decode_link_capability, decode_link_status, decode_slot_capability,
    };
    pub use sbr_regs::regs::{bridge_control, BRIDGE_CONTROL, LINK_CAPABILITIES, LINK_STATUS};
    pub use sbr_regs::{BusAddress, DecodeError, LinkField, RegisterSpec};
}

pub use access::{read_decoded, Credential, RegisterAccess};
pub use backends::{select_backend, BackendSelection, SetpciAccess, SimulatedAccess, SysfsAccess};
pub use clock::{format_timestamp, CancelToken, Clock, ManualClock, SystemClock};
pub use config::{AbortPolicy, TestConfig, MAX_LOOPS};
pub use discovery::{SlotDiscovery, SlotRecord, SlotTable};
pub use engine::{AbortReason, EngineState, LinkMismatch, Phase, RetrainCycleEngine, RunReport};
pub use error::{Result, SbrError};
pub use probe::{max_train_time, FixedProbe, PollConfig, PollingProbe, TrainTimeProbe};
pub use runlog::{FileSink, MemorySink, ResultSink, RunLog};
pub use session::RetrainSession;
pub use snapshot::{LinkCapabilitySnapshot, SlotSnapshot};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        AbortPolicy, Credential, FileSink, FixedProbe, RegisterAccess, Result, RetrainSession,
        RunReport, SbrError, SetpciAccess, SlotDiscovery, SystemClock, TestConfig,
    };
}
