//! Shared helpers for the meshwire end-to-end tests.
//!
//! Provides logger setup, short-timeout configs, a serde application
//! payload, and a small node wrapper that wires the callback channels most
//! scenarios need (peer up/down, conn up/down, recoverable errors).

use {
    meshwire::{Msg, NetError, PeerId, PeerNetConfig, PeerNetwork},
    serde::{Deserialize, Serialize},
    std::{future::Future, net::SocketAddr, sync::Arc, time::Duration},
    tokio::{sync::mpsc, time::sleep},
};

/// Application opcode used for test payloads.
pub const OP_DATA: u8 = 0x10;

/// Opcode whose handler blocks the delivery task forever (silences a node).
pub const OP_BLOCK: u8 = 0x11;

/// How long scenario assertions wait before declaring failure.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(20);

/// Initialize env_logger once for test output.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A bincode-encoded application payload carried inside test frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPayload {
    pub seq: u64,
    pub body: String,
}

impl TestPayload {
    pub fn new(seq: u64, body: impl Into<String>) -> Self {
        Self {
            seq,
            body: body.into(),
        }
    }

    pub fn to_msg(&self) -> Msg {
        Msg::new(OP_DATA, bincode::serialize(self).expect("serialize payload"))
    }

    pub fn from_msg(msg: &Msg) -> Self {
        bincode::deserialize(msg.payload()).expect("deserialize payload")
    }
}

/// Poll `cond` until it holds or [`WAIT_TIMEOUT`] elapses.
pub async fn wait_until<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if cond().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        sleep(Duration::from_millis(25)).await;
    }
}

/// A peer-network node with its callback streams captured.
pub struct TestNode {
    pub net: PeerNetwork,
    pub addr: SocketAddr,
    pub id: PeerId,
    /// `(remote_addr_of_conn, up)` per peer up/down callback.
    pub peer_events: mpsc::UnboundedReceiver<(SocketAddr, bool)>,
    /// `(error_text, fatal, async_id)` per error callback.
    pub errors: mpsc::UnboundedReceiver<(String, bool, Option<i32>)>,
    /// Decoded [`TestPayload`]s in delivery order.
    pub payloads: mpsc::UnboundedReceiver<TestPayload>,
    /// Claimed addresses from unknown-peer callbacks.
    pub unknown_peers: mpsc::UnboundedReceiver<SocketAddr>,
}

impl TestNode {
    /// Start a node listening on an ephemeral loopback port.
    pub async fn start(cfg: PeerNetConfig) -> Self {
        let net = PeerNetwork::new(cfg);

        let (peer_tx, peer_events) = mpsc::unbounded_channel();
        net.reg_peer_handler(move |conn, up| {
            let _ = peer_tx.send((conn.addr(), up));
        });

        let (err_tx, errors) = mpsc::unbounded_channel();
        net.reg_error_handler(move |err: &NetError, fatal, id| {
            let _ = err_tx.send((format!("{err}"), fatal, id));
        });

        let (msg_tx, payloads) = mpsc::unbounded_channel();
        net.reg_handler(OP_DATA, move |msg, _conn| {
            let _ = msg_tx.send(TestPayload::from_msg(&msg));
        });

        let (unknown_tx, unknown_peers) = mpsc::unbounded_channel();
        net.reg_unknown_peer_handler(move |claimed, _cert| {
            let _ = unknown_tx.send(claimed);
        });

        let addr = net
            .listen("127.0.0.1:0".parse().unwrap())
            .await
            .expect("listen");
        let id = PeerId::from_addr(&addr);
        Self {
            net,
            addr,
            id,
            peer_events,
            errors,
            payloads,
            unknown_peers,
        }
    }

    /// Register `other` as a known peer with its dial address set.
    pub fn register(&self, other: &TestNode) {
        self.net.add_peer(other.id);
        self.net.set_peer_addr(other.id, other.addr);
    }

    /// Wait for the next peer up/down event.
    pub async fn next_peer_event(&mut self) -> (SocketAddr, bool) {
        tokio::time::timeout(WAIT_TIMEOUT, self.peer_events.recv())
            .await
            .expect("timed out waiting for peer event")
            .expect("peer event channel closed")
    }

    /// Whether this node currently holds a live chosen channel for `pid`.
    pub fn connected_to(&self, pid: &PeerId) -> bool {
        self.net
            .get_peer_conn(pid)
            .ok()
            .flatten()
            .is_some_and(|conn| !conn.is_terminated())
    }
}

/// Two nodes registered with each other, each holding the other's address.
pub async fn node_pair(cfg: PeerNetConfig) -> (TestNode, TestNode) {
    let a = TestNode::start(cfg.clone()).await;
    let b = TestNode::start(cfg).await;
    a.register(&b);
    b.register(&a);
    (a, b)
}

/// Block until both sides report a live channel for each other.
pub async fn wait_established(a: &TestNode, b: &TestNode) {
    let (aid, bid) = (a.id, b.id);
    wait_until("a sees b's channel", || async { a.connected_to(&bid) }).await;
    wait_until("b sees a's channel", || async { b.connected_to(&aid) }).await;
}

/// A fast-paced config for handshake/liveness scenarios.
pub fn fast_cfg() -> PeerNetConfig {
    PeerNetConfig::dev_default()
}

/// Spawn a raw TCP listener that accepts connections and never speaks.
/// Accepted sockets are held open until the returned guard drops.
pub async fn silent_listener() -> (SocketAddr, Arc<tokio::net::TcpListener>) {
    let listener = Arc::new(
        tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind silent listener"),
    );
    let addr = listener.local_addr().unwrap();
    let accept = Arc::clone(&listener);
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = accept.accept().await {
            held.push(stream);
        }
    });
    (addr, listener)
}
