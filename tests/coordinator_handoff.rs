//! Two coordinators handing off over a shared in-memory coordination channel.

use async_trait::async_trait;
use penny::blob::{BlobStore, MemoryBlobStore};
use penny::caches::notified::NotifiedCache;
use penny::caches::{CACHES_KEY, CachesService, SharedNotifiedCache, lock};
use penny::channel::{Channel, ChannelEvent, IncomingMessage, OutboundMessage};
use penny::coordinator::signal::Signal;
use penny::coordinator::{Coordinator, CoordinatorState, HandoffConfig};
use penny::pings::{Expression, Triggered};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const BOT: u64 = 1016612301262041098;
const LOGS: u64 = 1067060193982156880;
const PEER_TIMEOUT: Duration = Duration::from_secs(120);
const DISABLE_WINDOW: Duration = Duration::from_secs(180);

/// Records every outbound message so the test can deliver it to all instances.
struct Bus {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

#[async_trait]
impl Channel for Bus {
    fn name(&self) -> &str {
        "bus"
    }

    async fn run(&self, _tx: mpsc::Sender<ChannelEvent>, cancel: CancellationToken) {
        cancel.cancelled().await;
    }

    async fn send_message(&self, msg: &OutboundMessage) -> color_eyre::Result<()> {
        self.tx
            .send(msg.clone())
            .map_err(|_| color_eyre::eyre::eyre!("bus closed"))
    }

    async fn send_dm(&self, _user_id: u64, _text: &str) -> color_eyre::Result<()> {
        Ok(())
    }

    async fn can_read(
        &self,
        _guild_id: u64,
        _channel_id: u64,
        _user_id: u64,
    ) -> color_eyre::Result<bool> {
        Ok(true)
    }
}

struct Instance {
    coordinator: Coordinator,
    notified: SharedNotifiedCache,
    enabled_calls: Arc<AtomicUsize>,
}

impl Instance {
    fn new(
        instance_id: u64,
        blobs: Arc<MemoryBlobStore>,
        tx: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Self {
        let notified: SharedNotifiedCache = Arc::new(Mutex::new(NotifiedCache::new(100)));
        let caches = Arc::new(CachesService::new(blobs, notified.clone()));
        let config = HandoffConfig {
            bot_user_id: BOT,
            coordination_channel_id: LOGS,
            peer_timeout: PEER_TIMEOUT,
            disable_window: DISABLE_WINDOW,
        };
        Self {
            coordinator: Coordinator::new(instance_id, config, Arc::new(Bus { tx }), caches),
            notified,
            enabled_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn start(&self) {
        let calls = self.enabled_calls.clone();
        self.coordinator.start(move || {
            calls.fetch_add(1, Ordering::SeqCst);
        });
    }

    fn state(&self) -> CoordinatorState {
        self.coordinator.state()
    }

    fn enabled_calls(&self) -> usize {
        self.enabled_calls.load(Ordering::SeqCst)
    }

    fn responds_to_users(&self) -> bool {
        self.coordinator.can_respond(&user_message("hello"))
    }
}

fn user_message(text: &str) -> ChannelEvent {
    ChannelEvent::Message(IncomingMessage {
        guild_id: Some(1),
        channel_id: 2,
        message_id: 3,
        author_id: 4,
        author_is_bot: false,
        author_role_ids: vec![],
        text: text.into(),
    })
}

fn bot_message(msg: &OutboundMessage) -> ChannelEvent {
    ChannelEvent::Message(IncomingMessage {
        guild_id: Some(1),
        channel_id: msg.channel_id,
        message_id: 99,
        author_id: BOT,
        author_is_bot: true,
        author_role_ids: vec![],
        text: msg.text.clone(),
    })
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Deliver every queued message to every instance until the bus is quiet.
/// Returns the delivered texts in order.
async fn pump(
    rx: &mut mpsc::UnboundedReceiver<OutboundMessage>,
    instances: &[&Instance],
) -> Vec<String> {
    let mut delivered = Vec::new();
    loop {
        settle().await;
        let mut any = false;
        while let Ok(msg) = rx.try_recv() {
            any = true;
            let event = bot_message(&msg);
            for instance in instances {
                instance.coordinator.can_respond(&event);
            }
            delivered.push(msg.text);
        }
        if !any {
            return delivered;
        }
    }
}

fn pair(user: &str, expression: &str) -> Triggered {
    Triggered::from([(
        user.to_owned(),
        HashSet::from([Expression::ExactMatch(expression.into())]),
    )])
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn new_instance_takes_over_from_live_instance() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let (tx, mut rx) = mpsc::unbounded_channel();

    // A is the only instance: it enables through its failsafe.
    let a = Instance::new(100, blobs.clone(), tx.clone());
    a.start();
    pump(&mut rx, &[&a]).await;
    tokio::time::advance(PEER_TIMEOUT + Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(a.state(), CoordinatorState::Enabled);
    assert_eq!(a.enabled_calls(), 1);
    lock(&a.notified).record_new(555, pair("7", "vapor"));

    // B starts while A is live.
    let b = Instance::new(200, blobs.clone(), tx.clone());
    let b_started = tokio::time::Instant::now();
    b.start();
    assert!(!b.responds_to_users());
    assert_eq!(b.enabled_calls(), 0);

    let delivered = pump(&mut rx, &[&a, &b]).await;
    assert_eq!(
        delivered,
        vec![Signal::Shutdown.message(200), Signal::DidShutdown.message(100)]
    );

    assert_eq!(a.state(), CoordinatorState::Disabled);
    assert!(!a.responds_to_users());
    assert_eq!(b.state(), CoordinatorState::Enabled);
    assert!(b.responds_to_users());
    assert_eq!(b.enabled_calls(), 1);
    assert!(tokio::time::Instant::now() - b_started < PEER_TIMEOUT);

    // A's cache made it across.
    assert!(blobs.get(CACHES_KEY).await.unwrap().is_some());
    assert!(lock(&b.notified).record_new(555, pair("7", "vapor")).is_empty());

    // B's failsafe fires later but changes nothing.
    tokio::time::advance(PEER_TIMEOUT).await;
    settle().await;
    assert_eq!(b.state(), CoordinatorState::Enabled);
    assert_eq!(b.enabled_calls(), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn retired_instance_that_is_not_killed_resumes() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let a = Instance::new(100, blobs.clone(), tx.clone());
    a.start();
    pump(&mut rx, &[&a]).await;
    tokio::time::advance(PEER_TIMEOUT + Duration::from_secs(1)).await;
    settle().await;

    let b = Instance::new(200, blobs, tx);
    b.start();
    pump(&mut rx, &[&a, &b]).await;
    assert_eq!(a.state(), CoordinatorState::Disabled);

    tokio::time::advance(DISABLE_WINDOW + Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(a.state(), CoordinatorState::Enabled);
    // The callback already ran when A first enabled.
    assert_eq!(a.enabled_calls(), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn lone_instance_enables_through_failsafe() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let b = Instance::new(200, Arc::new(MemoryBlobStore::new()), tx);
    b.start();
    assert_eq!(pump(&mut rx, &[&b]).await, vec![Signal::Shutdown.message(200)]);

    tokio::time::advance(PEER_TIMEOUT - Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(b.state(), CoordinatorState::AwaitingPeer);
    assert!(!b.responds_to_users());

    tokio::time::advance(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(b.state(), CoordinatorState::Enabled);
    assert_eq!(b.enabled_calls(), 1);

    // A late acknowledgement is a no-op.
    let late = OutboundMessage {
        channel_id: LOGS,
        text: Signal::DidShutdown.message(100),
    };
    assert!(!b.coordinator.can_respond(&bot_message(&late)));
    settle().await;
    assert_eq!(b.state(), CoordinatorState::Enabled);
    assert_eq!(b.enabled_calls(), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn own_signals_never_change_state() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let b = Instance::new(200, Arc::new(MemoryBlobStore::new()), tx);
    b.start();
    pump(&mut rx, &[&b]).await;

    let own_ack = OutboundMessage {
        channel_id: LOGS,
        text: Signal::DidShutdown.message(200),
    };
    b.coordinator.can_respond(&bot_message(&own_ack));
    settle().await;
    assert_eq!(b.state(), CoordinatorState::AwaitingPeer);

    tokio::time::advance(PEER_TIMEOUT + Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(b.state(), CoordinatorState::Enabled);

    let own_shutdown = OutboundMessage {
        channel_id: LOGS,
        text: Signal::Shutdown.message(200),
    };
    assert!(b.coordinator.can_respond(&bot_message(&own_shutdown)));
    settle().await;
    assert_eq!(b.state(), CoordinatorState::Enabled);
    assert!(rx.try_recv().is_err());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn waiting_instance_retires_without_overwriting_caches() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let b = Instance::new(200, blobs.clone(), tx.clone());
    b.start();
    pump(&mut rx, &[&b]).await;

    // A third instance shows up before anyone answered B.
    let c = Instance::new(300, blobs.clone(), tx);
    c.start();
    let delivered = pump(&mut rx, &[&b, &c]).await;
    assert_eq!(
        delivered,
        vec![Signal::Shutdown.message(300), Signal::DidShutdown.message(200)]
    );

    assert_eq!(b.state(), CoordinatorState::Disabled);
    assert_eq!(c.state(), CoordinatorState::Enabled);
    assert_eq!(c.enabled_calls(), 1);
    assert!(blobs.get(CACHES_KEY).await.unwrap().is_none());
}
