use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Transport, TransportConnector};

/// In-memory duplex transport for tests. The [`MockPeer`] half plays the
/// remote broker: whatever the peer sends shows up in `recv`, whatever the
/// transport sends shows up at the peer.
pub struct MockTransport {
    tx_to_peer: mpsc::UnboundedSender<Vec<u8>>,
    rx_from_peer: mpsc::UnboundedReceiver<Vec<u8>>,
    connected: Arc<AtomicBool>,
}

/// Remote half of a [`MockTransport`] pair.
pub struct MockPeer {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    connected: Arc<AtomicBool>,
}

/// Build a connected transport/peer pair.
pub fn pair() -> (MockTransport, MockPeer) {
    let (tx_to_peer, rx_at_peer) = mpsc::unbounded_channel();
    let (tx_at_peer, rx_from_peer) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(true));
    (
        MockTransport {
            tx_to_peer,
            rx_from_peer,
            connected: connected.clone(),
        },
        MockPeer {
            tx: tx_at_peer,
            rx: rx_at_peer,
            connected,
        },
    )
}

/// Remote kill switch for a link whose [`MockPeer`] has been handed off to
/// a pump task. Severing only flips the connected flag; the transport
/// notices on its next send.
#[derive(Clone)]
pub struct LinkControl {
    connected: Arc<AtomicBool>,
}

impl LinkControl {
    pub fn sever(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl MockPeer {
    /// Deliver a frame to the transport side.
    pub fn send(&self, data: Vec<u8>) {
        let _ = self.tx.send(data);
    }

    pub fn control(&self) -> LinkControl {
        LinkControl {
            connected: self.connected.clone(),
        }
    }

    /// Next frame the transport side sent, if any.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }

    /// Drop the link, as a broker crash would. The transport observes a
    /// closed stream on its next `recv`.
    pub fn sever(self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(anyhow::anyhow!("mock transport severed"));
        }
        self.tx_to_peer
            .send(data.to_vec())
            .map_err(|err| anyhow::anyhow!("mock peer gone: {err}"))
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx_from_peer.recv().await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Connector handing out pre-scripted transports, one per connection
/// attempt. An empty queue makes the next attempt fail, which is how tests
/// script connect errors and observe the reconnect path.
pub struct MockConnector {
    queue: parking_lot::Mutex<VecDeque<MockTransport>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            queue: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a fresh pair and return the peer half to the test.
    pub fn push_link(&self) -> MockPeer {
        let (transport, peer) = pair();
        self.queue.lock().push_back(transport);
        peer
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        match self.queue.lock().pop_front() {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(anyhow::anyhow!("no scripted transport available")),
        }
    }
}
