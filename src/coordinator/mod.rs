//! Instance handoff coordinator.
//!
//! During a rolling deploy the old and new bot processes are both connected
//! to the gateway for a while. The coordinator makes sure only one of them
//! responds, using the coordination channel itself as the medium:
//!
//! 1. A starting instance broadcasts [`Signal::Shutdown`] and waits.
//! 2. An enabled instance that sees a foreign `Shutdown` stops responding,
//!    persists its caches, and answers [`Signal::DidShutdown`].
//! 3. The waiting instance sees the foreign `DidShutdown`, restores the
//!    caches, and starts responding.
//!
//! Two timers cover the failure cases: a starting instance enables itself
//! after `peer_timeout` when nobody answers, and a retired instance that is
//! still alive after `disable_window` resumes and logs an anomaly.
//!
//! All state lives in a `watch` channel; every transition is a
//! compare-and-set through `send_if_modified`, so concurrent signals and
//! timers never race. Timers are not cancelled; they check the state when
//! they fire.

pub mod signal;

use crate::channel::{Channel, ChannelEvent, IncomingMessage, OutboundMessage};
use async_trait::async_trait;
use color_eyre::eyre::Result;
use signal::Signal;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Hooks for carrying caches from the retiring instance to its successor.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheHandoff: Send + Sync {
    /// Save the in-memory caches so a successor can pick them up.
    async fn persist(&self) -> Result<()>;

    /// Load caches saved by a predecessor into this process.
    async fn restore(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Not responding: either not started yet or retired for a newer instance.
    Disabled,
    /// Broadcast `Shutdown`, waiting for the previous instance to answer.
    AwaitingPeer,
    /// The previous instance answered; its caches are being loaded.
    Restoring,
    /// Responding to events.
    Enabled,
}

#[derive(Debug, Clone)]
pub struct HandoffConfig {
    /// The bot's own user id. Only its messages can be signals.
    pub bot_user_id: u64,
    pub coordination_channel_id: u64,
    /// How long a starting instance waits for `DidShutdown`.
    pub peer_timeout: Duration,
    /// How long a retired instance waits to be terminated before resuming.
    pub disable_window: Duration,
}

type OnEnabled = Box<dyn FnOnce() + Send>;

/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    instance_id: u64,
    config: HandoffConfig,
    channel: Arc<dyn Channel>,
    caches: Arc<dyn CacheHandoff>,
    state: watch::Sender<CoordinatorState>,
    on_enabled: Mutex<Option<OnEnabled>>,
}

/// Instance id for this process: its start time in Unix milliseconds.
pub fn process_instance_id() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

impl Coordinator {
    pub fn new(
        instance_id: u64,
        config: HandoffConfig,
        channel: Arc<dyn Channel>,
        caches: Arc<dyn CacheHandoff>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                instance_id,
                config,
                channel,
                caches,
                state: watch::Sender::new(CoordinatorState::Disabled),
                on_enabled: Mutex::new(None),
            }),
        }
    }

    pub fn instance_id(&self) -> u64 {
        self.inner.instance_id
    }

    pub fn state(&self) -> CoordinatorState {
        *self.inner.state.borrow()
    }

    pub fn is_enabled(&self) -> bool {
        self.state() == CoordinatorState::Enabled
    }

    /// Begin the handoff. Call once, after outbound sends work.
    ///
    /// `on_enabled` runs exactly once, the first time this instance becomes
    /// enabled. Returns immediately; the handshake continues in the
    /// background.
    pub fn start(&self, on_enabled: impl FnOnce() + Send + 'static) {
        {
            let mut slot = self
                .inner
                .on_enabled
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let started = self.inner.state.send_if_modified(|state| {
                if *state == CoordinatorState::Disabled && slot.is_none() {
                    *state = CoordinatorState::AwaitingPeer;
                    true
                } else {
                    false
                }
            });
            if !started {
                tracing::warn!(
                    instance_id = self.inner.instance_id,
                    "coordinator already started, ignoring"
                );
                return;
            }
            *slot = Some(Box::new(on_enabled));
        }

        tracing::info!(
            instance_id = self.inner.instance_id,
            "asking previous instances to retire"
        );

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.send_signal(Signal::Shutdown).await;
        });

        let deadline = tokio::time::Instant::now() + self.inner.config.peer_timeout;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if inner.enable_from(&[CoordinatorState::AwaitingPeer, CoordinatorState::Restoring]) {
                tracing::warn!(
                    instance_id = inner.instance_id,
                    timeout_secs = inner.config.peer_timeout.as_secs(),
                    "no previous instance acknowledged in time, enabled without restored caches"
                );
            }
        });
    }

    /// Whether `event` should be dispatched to handlers.
    ///
    /// Coordination signals from other instances update the state and are
    /// never dispatched. Never blocks; slow work is spawned.
    pub fn can_respond(&self, event: &ChannelEvent) -> bool {
        if let Some(message) = event_message(event)
            && self.is_coordination_message(message)
        {
            match Signal::parse(&message.text) {
                Ok((_, sender)) if sender == self.inner.instance_id => {
                    tracing::trace!("ignoring own signal");
                }
                Ok((signal, sender)) => {
                    tracing::debug!(%signal, sender, "received signal");
                    self.handle_signal(signal, sender);
                    return false;
                }
                Err(e) => {
                    tracing::error!(error = %e, text = %message.text, "unrecognized signal");
                }
            }
        }
        self.is_enabled()
    }

    fn is_coordination_message(&self, message: &IncomingMessage) -> bool {
        message.author_id == self.inner.config.bot_user_id
            && message.channel_id == self.inner.config.coordination_channel_id
    }

    fn handle_signal(&self, signal: Signal, sender: u64) {
        match signal {
            Signal::Shutdown => self.on_shutdown(sender),
            Signal::DidShutdown => self.on_did_shutdown(sender),
        }
    }

    fn on_shutdown(&self, sender: u64) {
        let mut retired_from = None;
        self.inner.state.send_if_modified(|state| {
            if *state == CoordinatorState::Disabled {
                return false;
            }
            retired_from = Some(*state);
            *state = CoordinatorState::Disabled;
            true
        });

        let Some(previous) = retired_from else {
            tracing::debug!(sender, "already disabled, ignoring shutdown signal");
            return;
        };
        tracing::info!(
            instance_id = self.inner.instance_id,
            successor = sender,
            ?previous,
            "retiring in favor of a newer instance"
        );

        // Only an instance that was serving has caches worth handing over.
        let persist = previous == CoordinatorState::Enabled;
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.retire(persist).await });
    }

    fn on_did_shutdown(&self, sender: u64) {
        let mut previous = CoordinatorState::Disabled;
        let restoring = self.inner.state.send_if_modified(|state| {
            previous = *state;
            if *state == CoordinatorState::AwaitingPeer {
                *state = CoordinatorState::Restoring;
                true
            } else {
                false
            }
        });

        if !restoring {
            match previous {
                CoordinatorState::Enabled => tracing::warn!(
                    sender,
                    "received did-shutdown signal but already enabled"
                ),
                CoordinatorState::Restoring => {
                    tracing::debug!(sender, "duplicate did-shutdown signal")
                }
                CoordinatorState::Disabled | CoordinatorState::AwaitingPeer => {
                    tracing::debug!(sender, "not waiting for a peer, ignoring did-shutdown")
                }
            }
            return;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.caches.restore().await {
                tracing::error!(error = ?e, "failed to restore caches from previous instance");
            }
            if inner.enable_from(&[CoordinatorState::Restoring]) {
                tracing::info!(
                    instance_id = inner.instance_id,
                    predecessor = sender,
                    "done loading previous instance's state, enabled"
                );
            }
        });
    }
}

impl Inner {
    /// Move to `Enabled` if the current state is one of `from`.
    fn enable_from(&self, from: &[CoordinatorState]) -> bool {
        let enabled = self.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = CoordinatorState::Enabled;
                true
            } else {
                false
            }
        });
        if enabled {
            let callback = self
                .on_enabled
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(callback) = callback {
                callback();
            }
        }
        enabled
    }

    async fn retire(&self, persist: bool) {
        if persist && let Err(e) = self.caches.persist().await {
            tracing::error!(error = ?e, "failed to persist caches for the next instance");
        }
        self.send_signal(Signal::DidShutdown).await;

        tokio::time::sleep(self.config.disable_window).await;
        if self.enable_from(&[CoordinatorState::Disabled]) {
            tracing::error!(
                instance_id = self.instance_id,
                window_secs = self.config.disable_window.as_secs(),
                "this instance should have been terminated by now, resuming responses"
            );
        }
    }

    async fn send_signal(&self, signal: Signal) {
        let msg = OutboundMessage {
            channel_id: self.config.coordination_channel_id,
            text: signal.message(self.instance_id),
        };
        if let Err(e) = self.channel.send_message(&msg).await {
            tracing::error!(%signal, error = ?e, "failed to send signal");
        }
    }
}

fn event_message(event: &ChannelEvent) -> Option<&IncomingMessage> {
    match event {
        ChannelEvent::Message(message) | ChannelEvent::Command { message, .. } => Some(message),
        ChannelEvent::Ready { .. } | ChannelEvent::MessageEdit(_) => None,
    }
}
