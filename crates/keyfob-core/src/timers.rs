//! Cancellable timers that report back on the controller input channel.
//!
//! Each [`TimerKind`] has at most one live timer. Arming a kind replaces any
//! timer of that kind, and every armed timer carries a generation number so
//! an expiry that was already queued when its timer got cancelled is
//! recognised as stale by [`Timers::accept`].

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{trace, warn};

use crate::messages::{Input, InputSender};

/// Longest delay or period a configuration may ask for.
pub const MAX_TIMER_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// The timers the controller uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Backoff after a failed scan.
    ScanRetry,
    /// Guard over connect, bond and service discovery.
    ConnectTimeout,
    /// Delay before reconnecting after a disconnect.
    ReconnectDelay,
    /// Periodic RSSI sampling while ready.
    RssiTick,
    /// Periodic supervisory check for a stalled supervisor.
    SupervisorTick,
}

/// Expiry notice for an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    /// Which timer fired.
    pub kind: TimerKind,
    generation: u64,
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    repeating: bool,
    task: JoinHandle<()>,
}

/// Owner of all live timers.
///
/// Dropping `Timers` aborts every timer it armed.
#[derive(Debug)]
pub struct Timers {
    inputs: InputSender,
    slots: HashMap<TimerKind, Slot>,
    next_generation: u64,
}

impl Timers {
    /// Create a timer set that reports on `inputs`.
    pub fn new(inputs: InputSender) -> Self {
        Self {
            inputs,
            slots: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Arm a one-shot timer, replacing any live timer of the same kind.
    pub fn arm(&mut self, kind: TimerKind, delay: Duration) {
        let generation = self.replace(kind);
        let inputs = self.inputs.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inputs.send(Input::Timer(TimerFired { kind, generation }));
        });
        trace!(?kind, ?delay, generation, "Timer armed");
        self.slots.insert(
            kind,
            Slot {
                generation,
                repeating: false,
                task,
            },
        );
    }

    /// Arm a repeating timer whose first expiry is one `period` from now.
    pub fn arm_repeating(&mut self, kind: TimerKind, period: Duration) {
        let generation = self.replace(kind);
        let inputs = self.inputs.clone();
        let first = Instant::now().checked_add(period);
        let task = tokio::spawn(async move {
            let Some(first) = first else {
                warn!(?kind, ?period, "Timer period out of range, timer will never fire");
                return;
            };
            let mut ticker = tokio::time::interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if inputs
                    .send(Input::Timer(TimerFired { kind, generation }))
                    .is_err()
                {
                    break;
                }
            }
        });
        trace!(?kind, ?period, generation, "Repeating timer armed");
        self.slots.insert(
            kind,
            Slot {
                generation,
                repeating: true,
                task,
            },
        );
    }

    /// Cancel a timer. Returns whether one was live.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.slots.remove(&kind) {
            Some(slot) => {
                slot.task.abort();
                trace!(?kind, "Timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every timer.
    pub fn cancel_all(&mut self) {
        for (_, slot) in self.slots.drain() {
            slot.task.abort();
        }
    }

    /// Cancel every timer except `keep`.
    pub fn cancel_all_except(&mut self, keep: TimerKind) {
        self.slots.retain(|kind, slot| {
            if *kind == keep {
                true
            } else {
                slot.task.abort();
                false
            }
        });
    }

    /// Whether a timer of this kind is live.
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots.contains_key(&kind)
    }

    /// Validate an expiry against the live timer of its kind.
    ///
    /// Returns `false` for expiries of cancelled or replaced timers. A
    /// one-shot timer is no longer live once its expiry is accepted.
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        let Some(slot) = self.slots.get(&fired.kind) else {
            trace!(kind = ?fired.kind, "Dropping expiry of cancelled timer");
            return false;
        };
        if slot.generation != fired.generation {
            trace!(kind = ?fired.kind, "Dropping expiry of replaced timer");
            return false;
        }
        if !slot.repeating {
            self.slots.remove(&fired.kind);
        }
        true
    }

    fn replace(&mut self, kind: TimerKind) -> u64 {
        self.cancel(kind);
        self.next_generation += 1;
        self.next_generation
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::input_channel;

    async fn next_timer(rx: &mut crate::messages::InputReceiver) -> TimerFired {
        match rx.recv().await {
            Some(Input::Timer(fired)) => fired,
            other => panic!("expected timer input, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_fires_once() {
        let (tx, mut rx) = input_channel();
        let mut timers = Timers::new(tx);

        timers.arm(TimerKind::ReconnectDelay, Duration::from_secs(5));
        assert!(timers.is_armed(TimerKind::ReconnectDelay));

        let fired = next_timer(&mut rx).await;
        assert_eq!(fired.kind, TimerKind::ReconnectDelay);
        assert!(timers.accept(fired));
        assert!(!timers.is_armed(TimerKind::ReconnectDelay));
        assert!(!timers.accept(fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_invalidates_queued_expiry() {
        let (tx, mut rx) = input_channel();
        let mut timers = Timers::new(tx);

        timers.arm(TimerKind::ConnectTimeout, Duration::from_secs(1));
        let stale = next_timer(&mut rx).await;

        timers.arm(TimerKind::ConnectTimeout, Duration::from_secs(10));
        assert!(!timers.accept(stale));
        assert!(timers.is_armed(TimerKind::ConnectTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_expiry() {
        let (tx, mut rx) = input_channel();
        let mut timers = Timers::new(tx);

        timers.arm(TimerKind::ScanRetry, Duration::from_secs(30));
        assert!(timers.cancel(TimerKind::ScanRetry));
        assert!(!timers.cancel(TimerKind::ScanRetry));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_timer_stays_armed() {
        let (tx, mut rx) = input_channel();
        let mut timers = Timers::new(tx);

        timers.arm_repeating(TimerKind::RssiTick, Duration::from_secs(2));
        for _ in 0..3 {
            let fired = next_timer(&mut rx).await;
            assert!(timers.accept(fired));
        }
        assert!(timers.is_armed(TimerKind::RssiTick));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_period_never_fires() {
        let (tx, mut rx) = input_channel();
        let mut timers = Timers::new(tx);

        timers.arm_repeating(TimerKind::SupervisorTick, Duration::MAX);
        timers.arm(TimerKind::ReconnectDelay, Duration::from_secs(5));

        let fired = next_timer(&mut rx).await;
        assert_eq!(fired.kind, TimerKind::ReconnectDelay);
        assert!(timers.accept(fired));

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(rx.try_recv().is_err());
        assert!(timers.is_armed(TimerKind::SupervisorTick));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_except() {
        let (tx, _rx) = input_channel();
        let mut timers = Timers::new(tx);

        timers.arm_repeating(TimerKind::SupervisorTick, Duration::from_secs(5));
        timers.arm_repeating(TimerKind::RssiTick, Duration::from_secs(2));
        timers.arm(TimerKind::ConnectTimeout, Duration::from_secs(10));

        timers.cancel_all_except(TimerKind::SupervisorTick);
        assert!(timers.is_armed(TimerKind::SupervisorTick));
        assert!(!timers.is_armed(TimerKind::RssiTick));
        assert!(!timers.is_armed(TimerKind::ConnectTimeout));
    }
}
