//! Shared test fixtures: an in-memory transport that routes channels
//! between registered peers, with hooks for fault injection.

#![allow(dead_code)]

use async_trait::async_trait;
use famlink_core::auth::Pin;
use famlink_core::peer::{
    Channel, ChannelEvent, ChannelHandle, PeerEvent, PeerManager, PeerManagerConfig, Transport,
    CHANNEL_EVENT_BUFFER,
};
use famlink_core::protocol::DataMessage;
use famlink_core::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// One side of an in-memory channel; `tx` delivers to the remote side.
pub struct MemoryChannel {
    peer_id: String,
    tx: mpsc::Sender<ChannelEvent>,
    closed: AtomicBool,
}

impl Channel for MemoryChannel {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn send(&self, message: &DataMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ChannelClosed);
        }
        self.tx
            .try_send(ChannelEvent::Data(message.clone()))
            .map_err(|_| Error::ChannelClosed)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.try_send(ChannelEvent::Closed);
        }
    }
}

struct Link {
    from: String,
    to: String,
    to_initiator: mpsc::Sender<ChannelEvent>,
    to_acceptor: mpsc::Sender<ChannelEvent>,
}

/// Routes in-memory channels between registered peers.
#[derive(Default)]
pub struct MemoryHub {
    endpoints: Mutex<HashMap<String, mpsc::Sender<ChannelHandle>>>,
    fail_connects: Mutex<HashMap<String, u32>>,
    links: Mutex<Vec<Link>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a peer; incoming channels arrive on the returned stream.
    pub fn register(&self, peer_id: &str) -> mpsc::Receiver<ChannelHandle> {
        let (tx, rx) = mpsc::channel(16);
        self.endpoints
            .lock()
            .unwrap()
            .insert(peer_id.to_string(), tx);
        rx
    }

    /// Remove a peer; subsequent connects to it fail.
    pub fn unregister(&self, peer_id: &str) {
        self.endpoints.lock().unwrap().remove(peer_id);
    }

    /// Make the next `count` connects toward `peer_id` fail.
    pub fn fail_next_connects(&self, peer_id: &str, count: u32) {
        self.fail_connects
            .lock()
            .unwrap()
            .insert(peer_id.to_string(), count);
    }

    /// Simulate a link failure: both ends of the newest `from -> to`
    /// channel observe an error.
    pub fn inject_error(&self, from: &str, to: &str) {
        let (a, b) = {
            let links = self.links.lock().unwrap();
            match links
                .iter()
                .rev()
                .find(|l| l.from == from && l.to == to)
            {
                Some(link) => (link.to_initiator.clone(), link.to_acceptor.clone()),
                None => return,
            }
        };
        let _ = a.try_send(ChannelEvent::Error("link failure".into()));
        let _ = b.try_send(ChannelEvent::Error("link failure".into()));
    }

    async fn connect(&self, from: &str, to: &str) -> Result<ChannelHandle> {
        {
            let mut failures = self.fail_connects.lock().unwrap();
            if let Some(remaining) = failures.get_mut(to) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::Transport("injected connect failure".into()));
                }
            }
        }

        let acceptor_endpoint = self
            .endpoints
            .lock()
            .unwrap()
            .get(to)
            .cloned()
            .ok_or_else(|| Error::Transport("peer unreachable".into()))?;

        let (init_tx, init_rx) = mpsc::channel(CHANNEL_EVENT_BUFFER);
        let (acc_tx, acc_rx) = mpsc::channel(CHANNEL_EVENT_BUFFER);

        let initiator_channel = Arc::new(MemoryChannel {
            peer_id: to.to_string(),
            tx: acc_tx.clone(),
            closed: AtomicBool::new(false),
        });
        let acceptor_channel = Arc::new(MemoryChannel {
            peer_id: from.to_string(),
            tx: init_tx.clone(),
            closed: AtomicBool::new(false),
        });

        self.links.lock().unwrap().push(Link {
            from: from.to_string(),
            to: to.to_string(),
            to_initiator: init_tx,
            to_acceptor: acc_tx,
        });

        acceptor_endpoint
            .send(ChannelHandle::new(acceptor_channel, acc_rx))
            .await
            .map_err(|_| Error::Transport("peer unreachable".into()))?;

        Ok(ChannelHandle::new(initiator_channel, init_rx))
    }
}

/// A peer's view of the hub.
pub struct MemoryTransport {
    local_id: String,
    hub: Arc<MemoryHub>,
}

impl MemoryTransport {
    pub fn new(hub: Arc<MemoryHub>, local_id: &str) -> Self {
        Self {
            local_id: local_id.to_string(),
            hub,
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, peer_id: &str) -> Result<ChannelHandle> {
        self.hub.connect(&self.local_id, peer_id).await
    }
}

/// A fully wired test peer: manager, event stream, and an accept loop.
pub struct TestPeer {
    pub manager: PeerManager,
    pub events: broadcast::Receiver<PeerEvent>,
    accept_task: JoinHandle<()>,
}

impl Drop for TestPeer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Fast policy timings so backoff paths finish within a test run.
pub fn fast_config(peer_id: &str, pin: &str) -> PeerManagerConfig {
    let mut config = PeerManagerConfig::new(peer_id, Pin::new(pin));
    config.reconnect_base = Duration::from_millis(10);
    config.handshake_timeout = Duration::from_millis(200);
    config
}

/// Spawn a peer on the hub with an accept loop running.
pub fn spawn_peer(hub: &Arc<MemoryHub>, config: PeerManagerConfig) -> TestPeer {
    let peer_id = config.peer_id.clone();
    let mut incoming = hub.register(&peer_id);
    let transport = Arc::new(MemoryTransport::new(hub.clone(), &peer_id));
    let (manager, events) = PeerManager::new(config, transport);

    let acceptor = manager.clone();
    let accept_task = tokio::spawn(async move {
        while let Some(handle) = incoming.recv().await {
            let _ = acceptor.accept_incoming(handle).await;
        }
    });

    TestPeer {
        manager,
        events,
        accept_task,
    }
}

/// Register a peer id whose incoming channels are never answered.
pub fn spawn_silent_peer(hub: &Arc<MemoryHub>, peer_id: &str) -> mpsc::Receiver<ChannelHandle> {
    hub.register(peer_id)
}

/// Wait up to two seconds for an event matching `pred`.
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<PeerEvent>,
    mut pred: F,
) -> PeerEvent
where
    F: FnMut(&PeerEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("expected event before deadline")
}
