//! Framed message network: opcode handler registry, bounded inbound queue,
//! and the delivery task.
//!
//! The delivery task plays the role of the user loop: it burst-drains the
//! inbound queue (at most `burst_size` messages per wakeup, then yields) and
//! invokes every user callback — message handlers, connection/peer status,
//! unknown-peer, and error callbacks. Handlers run on the delivery task only;
//! blocking there applies backpressure to readers without stalling I/O of
//! other connections' writers.

use {
    crate::{
        config::MsgNetConfig,
        conn::Conn,
        error::{NetError, Result},
        msg::Msg,
        pool::{run_dispatcher, Cmd, NullOverlay, Overlay, PoolCore, UserEvent},
    },
    bytes::Bytes,
    log::{debug, warn},
    parking_lot::{Mutex, RwLock},
    std::{
        collections::HashMap,
        net::SocketAddr,
        sync::{
            atomic::{AtomicI32, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::{
        sync::{mpsc, oneshot},
        task::JoinHandle,
    },
};

pub(crate) type MsgHandler = Arc<dyn Fn(Msg, &Arc<Conn>) + Send + Sync>;
pub(crate) type StatusCb = Arc<dyn Fn(&Arc<Conn>, bool) + Send + Sync>;
pub(crate) type UnknownPeerCb = Arc<dyn Fn(SocketAddr, Option<Bytes>) + Send + Sync>;
pub(crate) type ErrorCb = Arc<dyn Fn(&NetError, bool, Option<i32>) + Send + Sync>;

/// Registered user callbacks, read by the delivery task.
pub(crate) struct Callbacks {
    handlers: RwLock<HashMap<u8, MsgHandler>>,
    conn: RwLock<Option<StatusCb>>,
    peer: RwLock<Option<StatusCb>>,
    unknown_peer: RwLock<Option<UnknownPeerCb>>,
    error: RwLock<Option<ErrorCb>>,
}

impl Callbacks {
    fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            conn: RwLock::new(None),
            peer: RwLock::new(None),
            unknown_peer: RwLock::new(None),
            error: RwLock::new(None),
        }
    }

    pub(crate) fn set_handler(&self, opcode: u8, handler: MsgHandler) {
        self.handlers.write().insert(opcode, handler);
    }

    pub(crate) fn set_peer_cb(&self, cb: StatusCb) {
        *self.peer.write() = Some(cb);
    }

    pub(crate) fn set_unknown_peer_cb(&self, cb: UnknownPeerCb) {
        *self.unknown_peer.write() = Some(cb);
    }
}

fn dispatch_msg(cbs: &Callbacks, msg: Msg, conn: &Arc<Conn>) {
    if conn.is_terminated() {
        // Dead connections deliver nothing.
        return;
    }
    let handler = cbs.handlers.read().get(&msg.opcode()).cloned();
    match handler {
        Some(handler) => {
            conn.stats().record_recv(msg.len());
            debug!("got message opcode {:#04x} from {conn}", msg.opcode());
            handler(msg, conn);
        }
        None => warn!("unknown opcode: {:#04x}", msg.opcode()),
    }
}

fn dispatch_user(cbs: &Callbacks, event: UserEvent) {
    match event {
        UserEvent::Conn(conn, up) => {
            if let Some(cb) = cbs.conn.read().clone() {
                cb(&conn, up);
            }
        }
        UserEvent::Peer(conn, up) => {
            if let Some(cb) = cbs.peer.read().clone() {
                cb(&conn, up);
            }
        }
        UserEvent::UnknownPeer(addr, cert) => {
            if let Some(cb) = cbs.unknown_peer.read().clone() {
                cb(addr, cert);
            }
        }
        UserEvent::Error {
            err,
            fatal,
            async_id,
        } => match cbs.error.read().clone() {
            Some(cb) => cb(&err, fatal, async_id),
            None => warn!("unhandled network error (fatal={fatal}): {err}"),
        },
    }
}

/// The delivery task body: drains user notifications and bursts of inbound
/// messages until both channels close.
async fn delivery_loop(
    mut inbound_rx: mpsc::Receiver<(Msg, Arc<Conn>)>,
    mut user_rx: mpsc::UnboundedReceiver<UserEvent>,
    cbs: Arc<Callbacks>,
    burst_size: usize,
) {
    let mut inbound_open = true;
    let mut user_open = true;
    while inbound_open || user_open {
        tokio::select! {
            biased;
            event = user_rx.recv(), if user_open => match event {
                Some(event) => dispatch_user(&cbs, event),
                None => user_open = false,
            },
            item = inbound_rx.recv(), if inbound_open => match item {
                Some((msg, conn)) => {
                    dispatch_msg(&cbs, msg, &conn);
                    let mut drained = 1;
                    while drained < burst_size {
                        match inbound_rx.try_recv() {
                            Ok((msg, conn)) => {
                                dispatch_msg(&cbs, msg, &conn);
                                drained += 1;
                            }
                            Err(_) => break,
                        }
                    }
                    // Cooperative yield so a full queue cannot starve the
                    // rest of the loop.
                    tokio::task::yield_now().await;
                }
                None => inbound_open = false,
            },
        }
    }
}

// ── Shared network base ─────────────────────────────────────────────────────

/// State shared by all three network variants: the dispatcher handle, the
/// callback registry, and the async-id counter for deferred operations.
pub(crate) struct NetBase {
    cfg: MsgNetConfig,
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    pub(crate) cbs: Arc<Callbacks>,
    next_async_id: AtomicI32,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

/// Build the channel mesh and spawn the dispatcher and delivery tasks for a
/// network variant. Must be called within a tokio runtime.
pub(crate) fn spawn_net<O, F>(
    cfg: MsgNetConfig,
    read_timeout: Option<Duration>,
    make_overlay: F,
) -> (NetBase, mpsc::UnboundedSender<O::Cmd>)
where
    O: Overlay,
    F: FnOnce(mpsc::UnboundedSender<O::Cmd>, mpsc::UnboundedSender<UserEvent>, Arc<Callbacks>) -> O,
{
    if cfg.msg_magic == 0 {
        warn!("msg_magic is 0; frames from unrelated deployments will not be rejected");
    }
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (ext_tx, ext_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::channel(cfg.max_msg_queue_size.max(1));
    let (user_tx, user_rx) = mpsc::unbounded_channel();

    let cbs = Arc::new(Callbacks::new());
    let overlay = make_overlay(ext_tx.clone(), user_tx.clone(), cbs.clone());
    let core = PoolCore::new(cfg.clone(), read_timeout, inbound_tx, user_tx, event_tx);
    let dispatcher = tokio::spawn(run_dispatcher(core, overlay, cmd_rx, ext_rx, event_rx));
    let delivery = tokio::spawn(delivery_loop(
        inbound_rx,
        user_rx,
        cbs.clone(),
        cfg.burst_size.max(1),
    ));

    let base = NetBase {
        cfg,
        cmd_tx,
        cbs,
        next_async_id: AtomicI32::new(0),
        tasks: Mutex::new(Some((dispatcher, delivery))),
    };
    (base, ext_tx)
}

impl NetBase {
    /// Allocate the async id a deferred operation is tagged with.
    pub(crate) fn gen_async_id(&self) -> i32 {
        self.next_async_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn reg_handler(
        &self,
        opcode: u8,
        handler: impl Fn(Msg, &Arc<Conn>) + Send + Sync + 'static,
    ) {
        self.cbs.set_handler(opcode, Arc::new(handler));
    }

    pub(crate) fn reg_conn_handler(
        &self,
        cb: impl Fn(&Arc<Conn>, bool) + Send + Sync + 'static,
    ) {
        *self.cbs.conn.write() = Some(Arc::new(cb));
    }

    pub(crate) fn reg_error_handler(
        &self,
        cb: impl Fn(&NetError, bool, Option<i32>) + Send + Sync + 'static,
    ) {
        *self.cbs.error.write() = Some(Arc::new(cb));
    }

    pub(crate) async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Listen { addr, reply })
            .map_err(|_| NetError::ChannelClosed)?;
        rx.await.map_err(|_| NetError::ChannelClosed)?
    }

    pub(crate) async fn connect(&self, addr: SocketAddr) -> Result<Arc<Conn>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Connect { addr, reply })
            .map_err(|_| NetError::ChannelClosed)?;
        rx.await.map_err(|_| NetError::ChannelClosed)
    }

    pub(crate) fn connect_nb(&self, addr: SocketAddr) {
        let _ = self.cmd_tx.send(Cmd::ConnectNb { addr });
    }

    /// Synchronous send fast path: serialize and queue on the connection.
    pub(crate) fn send_msg(&self, msg: &Msg, conn: &Arc<Conn>) -> bool {
        let len = msg.len();
        let ok = conn.write_chunk(msg.encode(self.cfg.msg_magic));
        if ok {
            conn.stats().record_sent(len);
            debug!("wrote message opcode {:#04x} to {conn}", msg.opcode());
        }
        ok
    }

    pub(crate) fn send_msg_deferred(&self, msg: Msg, conn: Arc<Conn>) -> i32 {
        let id = self.gen_async_id();
        let _ = self.cmd_tx.send(Cmd::SendDeferred { msg, conn, id });
        id
    }

    pub(crate) fn terminate(&self, conn: &Arc<Conn>) {
        let _ = self.cmd_tx.send(Cmd::Terminate { conn: conn.clone() });
    }

    /// Stop the dispatcher (tearing down every connection), then the
    /// delivery task, and join both. Idempotent.
    pub(crate) async fn stop(&self) {
        let tasks = self.tasks.lock().take();
        let Some((dispatcher, delivery)) = tasks else {
            return;
        };
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Stop { reply }).is_ok() {
            let _ = rx.await;
        }
        let _ = dispatcher.await;
        let _ = delivery.await;
    }
}

// ── Public message network ──────────────────────────────────────────────────

/// A network of nodes exchanging framed, opcode-dispatched messages.
///
/// Construct inside a tokio runtime; the dispatcher and delivery tasks are
/// spawned immediately. Register handlers, then `listen` and/or `connect`.
pub struct MsgNetwork {
    base: NetBase,
    _ext_tx: mpsc::UnboundedSender<std::convert::Infallible>,
}

impl MsgNetwork {
    /// Create a message network with the given configuration.
    pub fn new(cfg: MsgNetConfig) -> Self {
        let (base, ext_tx) = spawn_net(cfg, None, |_, _, _| NullOverlay);
        Self {
            base,
            _ext_tx: ext_tx,
        }
    }

    /// Register the handler invoked for inbound messages with `opcode`.
    pub fn reg_handler(
        &self,
        opcode: u8,
        handler: impl Fn(Msg, &Arc<Conn>) + Send + Sync + 'static,
    ) {
        self.base.reg_handler(opcode, handler);
    }

    /// Register the connection up/down callback.
    pub fn reg_conn_handler(&self, cb: impl Fn(&Arc<Conn>, bool) + Send + Sync + 'static) {
        self.base.reg_conn_handler(cb);
    }

    /// Register the error callback. `fatal` distinguishes invariant
    /// violations from recoverable failures; recoverable errors raised by a
    /// deferred call carry that call's async id.
    pub fn reg_error_handler(
        &self,
        cb: impl Fn(&NetError, bool, Option<i32>) + Send + Sync + 'static,
    ) {
        self.base.reg_error_handler(cb);
    }

    /// Bind the passive listener; returns the bound address.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        self.base.listen(addr).await
    }

    /// Actively dial `addr`. The returned handle is live immediately;
    /// connection failures surface through the error callback and the
    /// connection-down path.
    pub async fn connect(&self, addr: SocketAddr) -> Result<Arc<Conn>> {
        self.base.connect(addr).await
    }

    /// Fire-and-forget dial.
    pub fn connect_nb(&self, addr: SocketAddr) {
        self.base.connect_nb(addr);
    }

    /// Queue a message on a connection. Returns false when the connection is
    /// dead or its bounded send queue is full.
    pub fn send_msg(&self, msg: &Msg, conn: &Arc<Conn>) -> bool {
        self.base.send_msg(msg, conn)
    }

    /// Send via the dispatcher; failures surface on the recoverable-error
    /// callback tagged with the returned async id.
    pub fn send_msg_deferred(&self, msg: Msg, conn: &Arc<Conn>) -> i32 {
        self.base.send_msg_deferred(msg, conn.clone())
    }

    /// Tear a connection down. Idempotent, callable from any thread.
    pub fn terminate(&self, conn: &Arc<Conn>) {
        self.base.terminate(conn);
    }

    /// Stop the network: dispatcher first, then delivery; joins both.
    pub async fn stop(&self) {
        self.base.stop().await;
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::{sync::Mutex as StdMutex, time::Duration},
        tokio::{sync::mpsc::unbounded_channel, time::timeout},
    };

    const OP_ECHO: u8 = 0x10;

    async fn recv_with_timeout<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_listen_connect_send_receive() {
        let server = MsgNetwork::new(MsgNetConfig::dev_default());
        let client = MsgNetwork::new(MsgNetConfig::dev_default());

        let (got_tx, mut got_rx) = unbounded_channel();
        server.reg_handler(OP_ECHO, move |msg, _conn| {
            let _ = got_tx.send(msg.payload().clone());
        });

        let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let conn = client.connect(addr).await.unwrap();

        assert!(client.send_msg(&Msg::new(OP_ECHO, &b"over the wire"[..]), &conn));
        let payload = recv_with_timeout(&mut got_rx).await;
        assert_eq!(&payload[..], b"over the wire");

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_conn_callbacks_fire_up_and_down() {
        let server = MsgNetwork::new(MsgNetConfig::dev_default());
        let client = MsgNetwork::new(MsgNetConfig::dev_default());

        let (ev_tx, mut ev_rx) = unbounded_channel();
        server.reg_conn_handler(move |conn, up| {
            let _ = ev_tx.send((conn.id(), up));
        });

        let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let conn = client.connect(addr).await.unwrap();

        let (id, up) = recv_with_timeout(&mut ev_rx).await;
        assert!(up);

        client.terminate(&conn);
        let (down_id, up) = recv_with_timeout(&mut ev_rx).await;
        assert!(!up);
        assert_eq!(id, down_id);

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_per_connection_fifo_delivery() {
        let server = MsgNetwork::new(MsgNetConfig::dev_default());
        let client = MsgNetwork::new(MsgNetConfig::dev_default());

        let (got_tx, mut got_rx) = unbounded_channel();
        server.reg_handler(OP_ECHO, move |msg, _conn| {
            let _ = got_tx.send(msg.payload().clone());
        });

        let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let conn = client.connect(addr).await.unwrap();

        for i in 0..100u32 {
            assert!(client.send_msg(&Msg::new(OP_ECHO, i.to_le_bytes().to_vec()), &conn));
        }
        for i in 0..100u32 {
            let payload = recv_with_timeout(&mut got_rx).await;
            assert_eq!(payload[..], i.to_le_bytes());
        }

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_send_deferred_on_dead_conn_reports_async_id() {
        let client = MsgNetwork::new(MsgNetConfig::dev_default());

        let errors = Arc::new(StdMutex::new(Vec::new()));
        let (err_tx, mut err_rx) = unbounded_channel();
        {
            let errors = errors.clone();
            client.reg_error_handler(move |err, fatal, id| {
                errors.lock().unwrap().push((format!("{err}"), fatal, id));
                let _ = err_tx.send(());
            });
        }

        // Dial a port nobody listens on; once the conn is dead, a deferred
        // send must fail with the async id attached.
        let conn = client.connect("127.0.0.1:1".parse().unwrap()).await.unwrap();
        let _ = recv_with_timeout(&mut err_rx).await; // connect failure report

        // Wait for the teardown to land, then the deferred send must fail.
        timeout(Duration::from_secs(5), async {
            while !conn.is_terminated() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection should die");

        let id = client.send_msg_deferred(Msg::new(OP_ECHO, &b"x"[..]), &conn);
        let _ = recv_with_timeout(&mut err_rx).await;
        let seen = errors.lock().unwrap();
        assert!(seen.iter().any(|(_, fatal, got)| !fatal && *got == Some(id)));

        client.stop().await;
    }

    #[tokio::test]
    async fn test_sync_send_on_dead_conn_returns_false() {
        let client = MsgNetwork::new(MsgNetConfig::dev_default());
        let conn = client.connect("127.0.0.1:1".parse().unwrap()).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while !conn.is_terminated() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection should die");
        assert!(!client.send_msg(&Msg::new(OP_ECHO, &b"x"[..]), &conn));
        client.stop().await;
    }

    #[tokio::test]
    async fn test_double_listen_fails() {
        let net = MsgNetwork::new(MsgNetConfig::dev_default());
        net.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let err = net.listen("127.0.0.1:0".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, NetError::ListenerAlreadyStarted));
        net.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let net = MsgNetwork::new(MsgNetConfig::dev_default());
        net.stop().await;
        net.stop().await;
    }
}
