//! Proximity estimation from signal strength.
//!
//! Raw RSSI is noisy: a single reflection can swing it by 10 dB. The
//! estimator smooths samples with a sliding median, applies a hysteresis
//! band so a holder standing at the edge does not flap between states, and
//! enforces a minimum interval between successive decisions.
//!
//! ```text
//!            smoothed dBm
//!   -60 ┤
//!       │   NEAR  (> unlock threshold)
//!   -88 ┼──────────────────────────────
//!       │   dead zone: no decision
//!   -93 ┼──────────────────────────────
//!       │   FAR   (< lock threshold)
//!  -110 ┤
//! ```
//!
//! # Example
//!
//! ```
//! use keyfob_core::proximity::{ProximityConfig, ProximityEstimator, RssiSample};
//! use keyfob_types::ProximityEvent;
//! use tokio::time::Instant;
//!
//! let mut estimator = ProximityEstimator::new(ProximityConfig::default()).unwrap();
//! let start = Instant::now();
//! let mut decided = None;
//! for rssi in [-70, -72, -71, -69, -70] {
//!     decided = estimator.push(RssiSample::new(rssi, start));
//! }
//! assert_eq!(decided, Some(ProximityEvent::Near));
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use futures::stream::{Stream, StreamExt};
use tokio::time::Instant;
use tracing::{debug, trace};

use keyfob_types::ProximityEvent;

use crate::error::{Error, Result};
use crate::timers::MAX_TIMER_PERIOD;

/// Weakest RSSI value a radio reports, in dBm.
pub const MIN_RSSI: i16 = -127;

/// Strongest RSSI value accepted, in dBm.
pub const MAX_RSSI: i16 = 0;

/// Tuning for the proximity estimator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProximityConfig {
    /// Number of samples the median is taken over. Must be odd.
    /// Default: 5.
    pub window: usize,
    /// Smoothed RSSI strictly above this is near. Default: -88 dBm.
    pub unlock_threshold_dbm: i16,
    /// Smoothed RSSI strictly below this is far. Default: -93 dBm.
    pub lock_threshold_dbm: i16,
    /// Minimum time between two decisions. Default: 2 seconds.
    pub debounce: Duration,
    /// Consecutive near-side samples required before deciding near.
    /// Default: 1.
    pub near_confirmations: u32,
    /// Consecutive far-side samples required before deciding far.
    /// Default: 1.
    pub far_confirmations: u32,
    /// How often the link's RSSI is sampled while ready. Default: 2 seconds.
    pub sample_interval: Duration,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            window: 5,
            unlock_threshold_dbm: -88,
            lock_threshold_dbm: -93,
            debounce: Duration::from_secs(2),
            near_confirmations: 1,
            far_confirmations: 1,
            sample_interval: Duration::from_secs(2),
        }
    }
}

impl ProximityConfig {
    /// Set the median window.
    #[must_use]
    pub fn window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// Set both thresholds.
    #[must_use]
    pub fn thresholds(mut self, unlock_dbm: i16, lock_dbm: i16) -> Self {
        self.unlock_threshold_dbm = unlock_dbm;
        self.lock_threshold_dbm = lock_dbm;
        self
    }

    /// Set the debounce interval.
    #[must_use]
    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Set the confirmation counts for near and far decisions.
    #[must_use]
    pub fn confirmations(mut self, near: u32, far: u32) -> Self {
        self.near_confirmations = near;
        self.far_confirmations = far;
        self
    }

    /// Set the RSSI sampling interval.
    #[must_use]
    pub fn sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    /// Validate the configuration.
    ///
    /// Checks that:
    /// - `window` is odd and non-zero
    /// - `unlock_threshold_dbm` is above `lock_threshold_dbm`
    /// - both confirmation counts are at least 1
    /// - `sample_interval` is non-zero and within [`MAX_TIMER_PERIOD`]
    pub fn validate(&self) -> Result<()> {
        if self.window == 0 || self.window % 2 == 0 {
            return Err(Error::invalid_config(format!(
                "proximity window must be odd and non-zero, got {}",
                self.window
            )));
        }
        if self.unlock_threshold_dbm <= self.lock_threshold_dbm {
            return Err(Error::invalid_config(format!(
                "unlock threshold ({} dBm) must be above lock threshold ({} dBm)",
                self.unlock_threshold_dbm, self.lock_threshold_dbm
            )));
        }
        if self.near_confirmations == 0 || self.far_confirmations == 0 {
            return Err(Error::invalid_config(
                "confirmation counts must be at least 1",
            ));
        }
        if self.sample_interval.is_zero() {
            return Err(Error::invalid_config("sample_interval must be > 0"));
        }
        if self.sample_interval > MAX_TIMER_PERIOD {
            return Err(Error::invalid_config(format!(
                "sample_interval must be at most {}s",
                MAX_TIMER_PERIOD.as_secs()
            )));
        }
        Ok(())
    }
}

/// A timestamped signal strength reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RssiSample {
    /// Signal strength in dBm.
    pub rssi: i16,
    /// When the sample was taken.
    pub at: Instant,
}

impl RssiSample {
    /// Create a sample.
    pub fn new(rssi: i16, at: Instant) -> Self {
        Self { rssi, at }
    }

    /// Create a sample stamped with the current time.
    pub fn now(rssi: i16) -> Self {
        Self::new(rssi, Instant::now())
    }
}

/// Median of a set of readings, or `None` when empty.
///
/// For an even count the lower middle value is returned.
pub fn median(values: &[i16]) -> Option<i16> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    Some(sorted[(sorted.len() - 1) / 2])
}

/// Turns a sample stream into debounced near/far decisions.
#[derive(Debug, Clone)]
pub struct ProximityEstimator {
    config: ProximityConfig,
    samples: VecDeque<i16>,
    last_event: Option<ProximityEvent>,
    last_emitted_at: Option<Instant>,
    near_streak: u32,
    far_streak: u32,
}

impl ProximityEstimator {
    /// Create an estimator. Fails if the configuration is invalid.
    pub fn new(config: ProximityConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            samples: VecDeque::with_capacity(config.window),
            config,
            last_event: None,
            last_emitted_at: None,
            near_streak: 0,
            far_streak: 0,
        })
    }

    /// The configuration in use.
    pub fn config(&self) -> &ProximityConfig {
        &self.config
    }

    /// Median of the current window, once the window is full.
    pub fn smoothed(&self) -> Option<i16> {
        if self.samples.len() < self.config.window {
            return None;
        }
        let values: Vec<i16> = self.samples.iter().copied().collect();
        median(&values)
    }

    /// The most recent decision.
    pub fn last_event(&self) -> Option<ProximityEvent> {
        self.last_event
    }

    /// Number of samples currently held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no samples are held.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Forget all samples and decisions.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.last_event = None;
        self.last_emitted_at = None;
        self.near_streak = 0;
        self.far_streak = 0;
    }

    /// Feed one sample. Returns a decision when one is made.
    ///
    /// A decision is only made once the window is full, only when it differs
    /// from the previous decision, only after the configured number of
    /// consecutive samples on that side of the band, and never sooner than
    /// the debounce interval after the previous decision.
    pub fn push(&mut self, sample: RssiSample) -> Option<ProximityEvent> {
        if !(MIN_RSSI..=MAX_RSSI).contains(&sample.rssi) {
            debug!(rssi = sample.rssi, "Discarding out-of-range RSSI sample");
            return None;
        }

        if self.samples.len() == self.config.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample.rssi);

        let smoothed = self.smoothed()?;
        let candidate = if smoothed > self.config.unlock_threshold_dbm {
            ProximityEvent::Near
        } else if smoothed < self.config.lock_threshold_dbm {
            ProximityEvent::Far
        } else {
            trace!(smoothed, "Smoothed RSSI in dead zone");
            self.near_streak = 0;
            self.far_streak = 0;
            return None;
        };

        if self.last_event == Some(candidate) {
            self.near_streak = 0;
            self.far_streak = 0;
            return None;
        }

        let (streak, required) = match candidate {
            ProximityEvent::Near => {
                self.far_streak = 0;
                self.near_streak = self.near_streak.saturating_add(1);
                (self.near_streak, self.config.near_confirmations)
            }
            ProximityEvent::Far => {
                self.near_streak = 0;
                self.far_streak = self.far_streak.saturating_add(1);
                (self.far_streak, self.config.far_confirmations)
            }
        };
        if streak < required {
            trace!(?candidate, streak, required, "Awaiting confirmation");
            return None;
        }

        if let Some(last) = self.last_emitted_at
            && sample.at.saturating_duration_since(last) < self.config.debounce
        {
            debug!(?candidate, smoothed, "Proximity change suppressed by debounce");
            return None;
        }

        debug!(event = ?candidate, smoothed, "Proximity changed");
        self.last_event = Some(candidate);
        self.last_emitted_at = Some(sample.at);
        self.near_streak = 0;
        self.far_streak = 0;
        Some(candidate)
    }
}

/// Adapt a stream of samples into a stream of proximity decisions.
///
/// ```
/// use futures::{StreamExt, stream};
/// use keyfob_core::proximity::{proximity_events, ProximityConfig, ProximityEstimator, RssiSample};
/// use keyfob_types::ProximityEvent;
/// use tokio::time::{Duration, Instant};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let start = Instant::now();
/// let samples = [-95i16, -96, -97, -95, -96]
///     .into_iter()
///     .enumerate()
///     .map(move |(i, rssi)| RssiSample::new(rssi, start + Duration::from_secs(2 * i as u64)));
/// let estimator = ProximityEstimator::new(ProximityConfig::default()).unwrap();
///
/// let events: Vec<_> = proximity_events(stream::iter(samples), estimator).collect().await;
/// assert_eq!(events, vec![ProximityEvent::Far]);
/// # }
/// ```
pub fn proximity_events<S>(
    samples: S,
    mut estimator: ProximityEstimator,
) -> impl Stream<Item = ProximityEvent>
where
    S: Stream<Item = RssiSample>,
{
    samples.filter_map(move |sample| futures::future::ready(estimator.push(sample)))
}
