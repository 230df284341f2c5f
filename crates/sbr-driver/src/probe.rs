// SPDX-License-Identifier: AGPL-3.0-only

//! Link training time estimation
//!
//! All selected slots share one wait, so the run waits as long as the
//! slowest slot needs: the maximum of the per-slot estimates.

use crate::access::{read_decoded, Credential, RegisterAccess};
use crate::clock::Clock;
use crate::error::{Result, SbrError};
use sbr_regs::codec;
use sbr_regs::regs::{
    bridge_control, BRIDGE_CONTROL, LINK_CAPABILITIES, LINK_STATUS, SECONDARY_BUS,
};
use sbr_regs::BusAddress;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Estimates how long the link below a bridge takes to retrain
pub trait TrainTimeProbe {
    /// Estimated training time for the link below `upstream`.
    ///
    /// # Errors
    ///
    /// Returns `SbrError::Probe` if no estimate can be produced.
    fn estimate(&self, upstream: &BusAddress) -> Result<Duration>;
}

/// The same operator-supplied duration for every slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedProbe(pub Duration);

impl FixedProbe {
    /// From fractional seconds; negative or non-finite values clamp to zero
    pub fn from_secs_f64(secs: f64) -> Self {
        Self(Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO))
    }
}

impl TrainTimeProbe for FixedProbe {
    fn estimate(&self, _upstream: &BusAddress) -> Result<Duration> {
        Ok(self.0)
    }
}

/// Parameters for [`PollingProbe`]
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    /// How long to hold the secondary bus in reset
    pub reset_hold: Duration,
    /// Delay between link status polls
    pub interval: Duration,
    /// Give up after this long
    pub timeout: Duration,
    /// Multiplier applied to the measured time
    pub safety_factor: f64,
    /// Lower bound on the returned estimate
    pub minimum: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            // PCIe requires reset asserted for at least 1 ms
            reset_hold: Duration::from_millis(2),
            interval: Duration::from_millis(10),
            timeout: Duration::from_secs(5),
            safety_factor: 2.0,
            minimum: Duration::from_millis(100),
        }
    }
}

/// Measures training time by retraining the link once and polling its
/// status until it matches the endpoint's capabilities.
///
/// The bridge's original control value is always written back, also when
/// the link never comes up.
#[derive(Debug)]
pub struct PollingProbe<'a, A: RegisterAccess + ?Sized, C: Clock + ?Sized> {
    access: &'a A,
    clock: &'a C,
    credential: &'a Credential,
    config: PollConfig,
}

impl<'a, A: RegisterAccess + ?Sized, C: Clock + ?Sized> PollingProbe<'a, A, C> {
    /// Probe through `access`, writing with `credential`
    pub fn new(access: &'a A, clock: &'a C, credential: &'a Credential) -> Self {
        Self {
            access,
            clock,
            credential,
            config: PollConfig::default(),
        }
    }

    /// Override polling parameters
    #[must_use]
    pub const fn with_config(mut self, config: PollConfig) -> Self {
        self.config = config;
        self
    }

    fn write_control(&self, upstream: &BusAddress, value: u16) -> Result<()> {
        self.access
            .write(upstream, BRIDGE_CONTROL, u32::from(value), self.credential)
    }

    /// Poll until status matches or the timeout passes; returns time taken.
    fn poll_until_trained(&self, upstream: &BusAddress) -> Result<Duration> {
        let secondary = read_decoded(
            self.access,
            upstream,
            SECONDARY_BUS,
            codec::decode_secondary_bus,
        )?;
        let downstream = BusAddress::downstream_of(upstream, secondary);
        let expected = read_decoded(
            self.access,
            &downstream,
            LINK_CAPABILITIES,
            codec::decode_link_capability,
        )?;

        let started = self.clock.now();
        loop {
            let elapsed =
                Duration::try_from(self.clock.now() - started).unwrap_or(Duration::ZERO);

            match read_decoded(self.access, &downstream, LINK_STATUS, codec::decode_link_status) {
                Ok(status) if status == expected => return Ok(elapsed),
                Ok(status) => debug!("{downstream}: link at {status}, waiting for {expected}"),
                Err(e) => debug!("{downstream}: {e}"),
            }

            if elapsed >= self.config.timeout {
                return Err(SbrError::probe(
                    *upstream,
                    format!(
                        "link below did not reach {expected} within {:?}",
                        self.config.timeout
                    ),
                ));
            }

            self.clock.wait(self.config.interval);
        }
    }
}

impl<A: RegisterAccess + ?Sized, C: Clock + ?Sized> TrainTimeProbe for PollingProbe<'_, A, C> {
    fn estimate(&self, upstream: &BusAddress) -> Result<Duration> {
        let original = read_decoded(
            self.access,
            upstream,
            BRIDGE_CONTROL,
            codec::decode_bridge_control,
        )?;

        self.write_control(upstream, bridge_control::RETRAIN_TRIGGER)?;
        self.clock.wait(self.config.reset_hold);

        let measured = match self
            .write_control(upstream, original)
            .and_then(|()| self.poll_until_trained(upstream))
        {
            Ok(measured) => measured,
            Err(e) => {
                // Leave the bridge as we found it before reporting
                if let Err(restore) = self.write_control(upstream, original) {
                    warn!("Failed to restore bridge control on {upstream}: {restore}");
                }
                return Err(e);
            }
        };

        let estimate = measured
            .mul_f64(self.config.safety_factor)
            .max(self.config.minimum);
        info!("{upstream}: link trained in {measured:?}, using {estimate:?}");
        Ok(estimate)
    }
}

/// Largest estimate across `upstreams`.
///
/// # Errors
///
/// Returns the first probe failure.
pub fn max_train_time<P>(probe: &P, upstreams: &[BusAddress]) -> Result<Duration>
where
    P: TrainTimeProbe + ?Sized,
{
    upstreams.iter().try_fold(Duration::ZERO, |max, upstream| {
        let estimate = probe.estimate(upstream)?;
        debug!("{upstream}: train time estimate {estimate:?}");
        Ok(max.max(estimate))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{SimulatedAccess, SimulatedSlot};
    use crate::clock::ManualClock;
    use sbr_regs::LinkField;
    use std::collections::HashMap;

    struct TableProbe(HashMap<BusAddress, Duration>);

    impl TrainTimeProbe for TableProbe {
        fn estimate(&self, upstream: &BusAddress) -> Result<Duration> {
            self.0
                .get(upstream)
                .copied()
                .ok_or_else(|| SbrError::probe(*upstream, "unknown bridge"))
        }
    }

    #[test]
    fn shared_wait_is_the_maximum() {
        let a = BusAddress::new(0, 0x1c, 0);
        let b = BusAddress::new(0, 0x1d, 0);
        let c = BusAddress::new(0, 0x1e, 0);
        let probe = TableProbe(HashMap::from([
            (a, Duration::from_millis(300)),
            (b, Duration::from_millis(1200)),
            (c, Duration::from_millis(500)),
        ]));

        // Not the sum (2.0 s) or the mean (0.666 s)
        assert_eq!(
            max_train_time(&probe, &[a, b, c]).unwrap(),
            Duration::from_millis(1200)
        );
        assert_eq!(max_train_time(&probe, &[]).unwrap(), Duration::ZERO);
    }

    #[test]
    fn estimate_failure_propagates() {
        let probe = TableProbe(HashMap::new());
        assert!(matches!(
            max_train_time(&probe, &[BusAddress::new(0, 1, 0)]),
            Err(SbrError::Probe { .. })
        ));
    }

    #[test]
    fn fixed_train_time_clamps_bad_input() {
        assert_eq!(FixedProbe::from_secs_f64(1.5).0, Duration::from_millis(1500));
        assert_eq!(FixedProbe::from_secs_f64(-1.0).0, Duration::ZERO);
        assert_eq!(FixedProbe::from_secs_f64(f64::NAN).0, Duration::ZERO);
    }

    #[test]
    fn polling_estimate_retrains_and_restores() {
        let bridge = BusAddress::new(0, 0x1c, 0);
        let sim = SimulatedAccess::new().with_slot(
            SimulatedSlot::new(bridge, 3, 0x03, LinkField::new(4, 3)).with_bridge_control(0x0013),
        );
        let clock = ManualClock::new();
        let cred = Credential::none();

        let estimate = PollingProbe::new(&sim, &clock, &cred).estimate(&bridge).unwrap();

        // The simulated link is up on the first poll, so the floor applies
        assert_eq!(estimate, PollConfig::default().minimum);
        assert_eq!(sim.retrains(&bridge), 1);
        assert_eq!(sim.bridge_control(&bridge), Some(0x0013));
        let values: Vec<u32> = sim.writes().iter().map(|w| w.value).collect();
        assert_eq!(values, vec![0x0043, 0x0013]);
    }

    #[test]
    fn polling_estimate_times_out_and_restores() {
        let bridge = BusAddress::new(0, 0x1c, 0);
        let sim = SimulatedAccess::new().with_slot(
            SimulatedSlot::new(bridge, 3, 0x03, LinkField::new(4, 3))
                .trains_to(LinkField::new(1, 3)),
        );
        let clock = ManualClock::new();
        let cred = Credential::none();
        let config = PollConfig {
            timeout: Duration::from_millis(50),
            ..PollConfig::default()
        };

        let err = PollingProbe::new(&sim, &clock, &cred)
            .with_config(config)
            .estimate(&bridge)
            .unwrap_err();

        assert!(matches!(err, SbrError::Probe { .. }));
        assert_eq!(sim.bridge_control(&bridge), Some(0x0003));
        // Virtual time only: reset hold plus the polls up to the timeout
        assert!(clock.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn failed_release_is_retried_before_reporting() {
        let bridge = BusAddress::new(0, 0x1c, 0);
        let sim = SimulatedAccess::new().with_slot(
            SimulatedSlot::new(bridge, 3, 0x03, LinkField::new(4, 3)).with_bridge_control(0x0013),
        );
        let clock = ManualClock::new();
        let cred = Credential::none();
        // Assert goes through, the release that follows does not
        sim.fail_write_attempt(bridge, 2);

        let err = PollingProbe::new(&sim, &clock, &cred)
            .estimate(&bridge)
            .unwrap_err();

        assert!(matches!(err, SbrError::RegisterWrite { .. }));
        assert_eq!(sim.bridge_control(&bridge), Some(0x0013));
        let values: Vec<u32> = sim.writes().iter().map(|w| w.value).collect();
        assert_eq!(values, vec![0x0043, 0x0013]);
    }
}
