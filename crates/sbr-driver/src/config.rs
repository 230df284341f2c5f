//! Test run configuration

use crate::access::Credential;
use crate::error::{Result, SbrError};
use std::fmt;
use std::str::FromStr;

/// What to do when a link comes back different from its capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbortPolicy {
    /// Record the mismatch and keep going (`n`)
    #[default]
    Continue,
    /// Record the mismatch, flush the log and stop (`y`)
    AbortOnMismatch,
}

impl FromStr for AbortPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "y" | "yes" => Ok(Self::AbortOnMismatch),
            "n" | "no" => Ok(Self::Continue),
            other => Err(format!("expected y or n, got {other:?}")),
        }
    }
}

impl fmt::Display for AbortPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => write!(f, "n"),
            Self::AbortOnMismatch => write!(f, "y"),
        }
    }
}

/// Largest loop count whose `2N + 1` iterations fit in a `u32`
pub const MAX_LOOPS: u32 = (u32::MAX - 1) / 2;

/// Operator inputs for one run
#[derive(Debug, Clone)]
pub struct TestConfig {
    /// Slot numbers to exercise, in the order they are driven
    pub slots: Vec<u16>,

    /// Number of retrain loops (N)
    pub loops: u32,

    /// Mismatch handling
    pub abort_policy: AbortPolicy,

    /// Credential for bridge control writes
    pub credential: Credential,
}

impl TestConfig {
    /// A run over `slots` with `loops` retrains per slot
    pub fn new(slots: Vec<u16>, loops: u32) -> Self {
        Self {
            slots,
            loops,
            abort_policy: AbortPolicy::default(),
            credential: Credential::none(),
        }
    }

    /// Set the mismatch policy
    #[must_use]
    pub fn with_abort_policy(mut self, policy: AbortPolicy) -> Self {
        self.abort_policy = policy;
        self
    }

    /// Set the write credential
    #[must_use]
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    /// Total iterations: `2N + 1`, so the run starts and ends on a check
    /// with the original bridge control restored.
    ///
    /// # Errors
    ///
    /// Returns `SbrError::Config` if `loops` exceeds [`MAX_LOOPS`].
    pub fn iterations(&self) -> Result<u32> {
        self.loops
            .checked_mul(2)
            .and_then(|n| n.checked_add(1))
            .ok_or_else(|| {
                SbrError::config(format!(
                    "loop count {} exceeds the maximum of {MAX_LOOPS}",
                    self.loops
                ))
            })
    }
}
