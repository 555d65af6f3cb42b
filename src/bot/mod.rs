//! Event router: the bot's main loop.
//!
//! Runs a `tokio::select!` loop over gateway events and the shutdown token.
//! The first `Ready` starts the handoff coordinator; every other event goes
//! through [`Coordinator::can_respond`] and, if allowed, is handled on its
//! own task so slow sends never hold up the loop.

pub mod commands;
pub mod handler;

use crate::blob::BlobStore;
use crate::caches::notified::NotifiedCache;
use crate::caches::{CachesService, SharedNotifiedCache};
use crate::channel::{Channel, ChannelEvent};
use crate::config::PennyConfig;
use crate::coordinator::Coordinator;
use crate::pings::PingsStore;
use crate::pings::commands::PingLimits;
use color_eyre::eyre::Result;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Everything an event handler needs.
pub struct Services {
    pub channel: Arc<dyn Channel>,
    pub pings: PingsStore,
    pub limits: PingLimits,
    pub notified: SharedNotifiedCache,
    pub command_prefix: String,
}

impl Services {
    async fn handle(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(message) | ChannelEvent::MessageEdit(message) => {
                handler::notify_pings(self, &message).await;
            }
            ChannelEvent::Command {
                message,
                command,
                args,
            } => {
                commands::handle_command(self, &message, &command, &args).await;
            }
            ChannelEvent::Ready { .. } => {}
        }
    }
}

pub struct BotRunner {
    app_id: u64,
    channel: Arc<dyn Channel>,
    services: Arc<Services>,
    coordinator: Coordinator,
}

impl BotRunner {
    pub fn new(
        config: &PennyConfig,
        instance_id: u64,
        channel: Arc<dyn Channel>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        let notified: SharedNotifiedCache = Arc::new(Mutex::new(NotifiedCache::default()));
        let caches = Arc::new(CachesService::new(blobs.clone(), notified.clone()));
        let coordinator = Coordinator::new(
            instance_id,
            config.handoff_config(),
            channel.clone(),
            caches,
        );
        let services = Arc::new(Services {
            channel: channel.clone(),
            pings: PingsStore::new(blobs),
            limits: config.pings.clone(),
            notified,
            command_prefix: config.command_prefix.clone(),
        });
        Self {
            app_id: config.app_id,
            channel,
            services,
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Run until `cancel` fires or the channel closes.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<ChannelEvent>(64);
        let channel = self.channel.clone();
        let channel_cancel = cancel.clone();
        tokio::spawn(async move {
            channel.run(tx, channel_cancel).await;
        });

        tracing::info!(
            channel = self.channel.name(),
            instance_id = self.coordinator.instance_id(),
            prefix = %self.services.command_prefix,
            "bot running"
        );
        let mut started = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("shutting down");
                    break;
                }

                event = rx.recv() => {
                    match event {
                        Some(event) => self.dispatch(event, &mut started),
                        None => {
                            tracing::info!("channel closed, shutting down");
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn dispatch(&self, event: ChannelEvent, started: &mut bool) {
        if let ChannelEvent::Ready { bot_user_id } = event {
            if *started {
                tracing::debug!("gateway ready again after reconnect");
                return;
            }
            if bot_user_id != self.app_id {
                tracing::warn!(
                    bot_user_id,
                    app_id = self.app_id,
                    "connected as a different user than app_id; handoff signals will not be recognized"
                );
            }
            *started = true;
            self.coordinator
                .start(|| tracing::info!("now responding to events"));
            return;
        }

        if !self.coordinator.can_respond(&event) {
            tracing::trace!("not responding to event");
            return;
        }
        let services = self.services.clone();
        tokio::spawn(async move { services.handle(event).await });
    }
}

/// A token cancelled on SIGINT or SIGTERM.
pub fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("shutdown signal received");
        shutdown_cancel.cancel();
    });
    cancel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::channel::{IncomingMessage, MockChannel};
    use crate::coordinator::CoordinatorState;
    use crate::coordinator::signal::Signal;

    const APP: u64 = 10;
    const LOGS: u64 = 20;

    fn config() -> PennyConfig {
        PennyConfig::parse(&format!("app_id = {APP}\ncoordination_channel_id = {LOGS}\n"))
            .unwrap()
    }

    fn user_message(text: &str) -> ChannelEvent {
        ChannelEvent::Message(IncomingMessage {
            guild_id: Some(1),
            channel_id: 2,
            message_id: 3,
            author_id: 300,
            author_is_bot: false,
            author_role_ids: vec![],
            text: text.into(),
        })
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn ready_starts_handoff_and_gates_events() {
        let mut channel = MockChannel::new();
        channel.expect_name().return_const("mock".to_owned());
        channel.expect_run().returning(|tx, _| {
            tx.try_send(ChannelEvent::Ready { bot_user_id: APP }).unwrap();
            tx.try_send(ChannelEvent::Ready { bot_user_id: APP }).unwrap();
            tx.try_send(user_message("vapor")).unwrap();
        });
        channel
            .expect_send_message()
            .withf(|m| m.channel_id == LOGS && m.text == Signal::Shutdown.message(42))
            .times(1)
            .returning(|_| Ok(()));
        channel.expect_send_dm().times(0);

        let runner = BotRunner::new(
            &config(),
            42,
            Arc::new(channel),
            Arc::new(MemoryBlobStore::new()),
        );
        runner.run(CancellationToken::new()).await.unwrap();
        settle().await;

        // Still waiting for the previous instance, so the message was dropped.
        assert_eq!(runner.coordinator().state(), CoordinatorState::AwaitingPeer);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn cancel_stops_the_loop() {
        let mut channel = MockChannel::new();
        channel.expect_name().return_const("mock".to_owned());
        channel.expect_run().returning(|_, _| {});
        let runner = BotRunner::new(
            &config(),
            42,
            Arc::new(channel),
            Arc::new(MemoryBlobStore::new()),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        runner.run(cancel).await.unwrap();
        assert_eq!(runner.coordinator().state(), CoordinatorState::Disabled);
    }
}
