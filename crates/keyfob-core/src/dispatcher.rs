//! Serialized command dispatch.
//!
//! Commands are written to the peripheral strictly one at a time, in the
//! order they were accepted. A single worker task owns the write path; the
//! next command is not started until the previous write has completed,
//! failed or timed out.
//!
//! The dispatcher is *active* only while the link is ready. Deactivating it
//! drops everything still queued, and enqueueing while inactive is refused.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keyfob_types::Command;

use crate::error::{Error, Result};
use crate::events::{ControllerEvent, EventDispatcher};
use crate::traits::{CharacteristicHandle, PeripheralLink};

/// Configuration for the command dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Maximum number of commands waiting to be written, or `None` for no
    /// limit. Default: 32.
    pub capacity: Option<usize>,
    /// How long a single write may take before it is abandoned.
    /// Default: 5 seconds.
    pub write_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            capacity: Some(32),
            write_timeout: Duration::from_secs(5),
        }
    }
}

impl DispatcherConfig {
    /// Set the queue capacity.
    #[must_use]
    pub fn capacity(mut self, capacity: Option<usize>) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the write timeout.
    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == Some(0) {
            return Err(Error::invalid_config("dispatcher capacity must be > 0"));
        }
        if self.write_timeout.is_zero() {
            return Err(Error::invalid_config("write_timeout must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<Command>,
    target: Option<CharacteristicHandle>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<QueueState>,
    wake: Notify,
    config: DispatcherConfig,
    events: EventDispatcher,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn drop_command(&self, command: Command, reason: String) {
        debug!(%command, %reason, "Command dropped");
        self.events
            .send(ControllerEvent::CommandDropped { command, reason });
    }
}

/// Cloneable handle for submitting commands.
#[derive(Debug, Clone)]
pub struct CommandSender {
    shared: Arc<Shared>,
}

impl CommandSender {
    /// Append a command to the queue.
    ///
    /// Fails with [`Error::NotReady`] while the dispatcher is inactive and
    /// with [`Error::QueueFull`] when the queue is at capacity. Either way a
    /// [`ControllerEvent::CommandDropped`] is published.
    pub fn enqueue(&self, command: Command) -> Result<()> {
        {
            let mut state = self.shared.lock();
            if state.target.is_none() {
                drop(state);
                self.shared
                    .drop_command(command, "peripheral not ready".to_string());
                return Err(Error::NotReady(command));
            }
            if let Some(capacity) = self.shared.config.capacity
                && state.queue.len() >= capacity
            {
                drop(state);
                self.shared
                    .drop_command(command, format!("queue full ({capacity} pending)"));
                return Err(Error::QueueFull { command, capacity });
            }
            state.queue.push_back(command);
            debug!(%command, pending = state.queue.len(), "Command queued");
        }
        self.shared.wake.notify_one();
        Ok(())
    }
}

/// Owns the write worker.
#[derive(Debug)]
pub struct CommandDispatcher {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

impl CommandDispatcher {
    /// Spawn the worker. The dispatcher starts inactive.
    pub fn spawn(
        link: Arc<dyn PeripheralLink>,
        config: DispatcherConfig,
        events: EventDispatcher,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            config,
            events,
        });
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker(link, Arc::clone(&shared), cancel.clone()));
        Self {
            shared,
            cancel,
            worker,
        }
    }

    /// A handle for submitting commands.
    pub fn sender(&self) -> CommandSender {
        CommandSender {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Start accepting commands, written to `target`.
    pub fn activate(&self, target: CharacteristicHandle) {
        self.shared.lock().target = Some(target);
        debug!(characteristic = %target.characteristic, "Dispatcher active");
        self.shared.wake.notify_one();
    }

    /// Stop accepting commands and drop everything still queued.
    ///
    /// Returns the number of commands dropped. A write already in flight is
    /// allowed to finish.
    pub fn deactivate(&self) -> usize {
        let dropped: Vec<Command> = {
            let mut state = self.shared.lock();
            state.target = None;
            state.queue.drain(..).collect()
        };
        for command in &dropped {
            self.shared
                .drop_command(*command, "link left ready state".to_string());
        }
        if !dropped.is_empty() {
            info!(count = dropped.len(), "Cleared pending commands");
        }
        dropped.len()
    }

    /// Whether commands are currently accepted.
    pub fn is_active(&self) -> bool {
        self.shared.lock().target.is_some()
    }

    /// Number of commands waiting to be written.
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Stop the worker and wait for it to exit.
    pub async fn shutdown(self) {
        self.deactivate();
        self.cancel.cancel();
        if let Err(e) = self.worker.await
            && e.is_panic()
        {
            warn!("Dispatcher worker panicked: {}", e);
        }
    }
}

async fn run_worker(link: Arc<dyn PeripheralLink>, shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        let job = {
            let mut state = shared.lock();
            match state.target {
                Some(target) => state.queue.pop_front().map(|command| (command, target)),
                None => None,
            }
        };

        let Some((command, target)) = job else {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = shared.wake.notified() => {}
            }
            continue;
        };

        let timeout = shared.config.write_timeout;
        let outcome =
            match tokio::time::timeout(timeout, link.write(&target, command.as_bytes())).await {
                Ok(result) => result,
                Err(_) => Err(Error::timeout(format!("write {command}"), timeout)),
            };

        match outcome {
            Ok(()) => {
                info!(%command, "Command sent");
                shared.events.send(ControllerEvent::CommandSent { command });
            }
            Err(e) => {
                warn!(%command, error = %e, "Command write failed");
                shared.events.send(ControllerEvent::CommandFailed {
                    command,
                    error: e.to_string(),
                });
            }
        }
    }
    debug!("Dispatcher worker stopped");
}
