//! Connection pool engine: the dispatcher loop and worker shards.
//!
//! One dispatcher task owns the pool map, the listener, and all structural
//! mutation. Handles talk to it over an unbounded command channel; I/O tasks
//! report back over an event channel. Commands submitted from one handle
//! execute in submission order.
//!
//! The overlay hook trait is the seam between the pool and the network
//! variants layered on top of it: the plain message network installs a no-op
//! overlay, the peer network installs its handshake state machine, and the
//! client network installs its address index.

use {
    crate::{
        config::MsgNetConfig,
        conn::{reader_task, writer_task, Conn, ConnMode, ReaderParams},
        error::{NetError, Result},
        msg::Msg,
    },
    bytes::Bytes,
    log::{debug, error, info, warn},
    std::{
        collections::HashMap,
        net::SocketAddr,
        sync::{atomic::Ordering, Arc},
        time::Duration,
    },
    tokio::{
        net::{TcpSocket, TcpStream},
        sync::{mpsc, oneshot},
        task::JoinHandle,
        time::timeout,
    },
};

/// Commands posted to the dispatcher by user-facing handles.
pub(crate) enum Cmd {
    /// Dial `addr`; the reply carries the connection handle immediately.
    /// Socket-level failures surface later through the error callback and
    /// the connection's teardown.
    Connect {
        addr: SocketAddr,
        reply: oneshot::Sender<Arc<Conn>>,
    },
    /// Fire-and-forget dial.
    ConnectNb { addr: SocketAddr },
    /// Bind the passive listener.
    Listen {
        addr: SocketAddr,
        reply: oneshot::Sender<Result<SocketAddr>>,
    },
    /// Tear a connection down. Idempotent.
    Terminate { conn: Arc<Conn> },
    /// Serialize-and-send on the dispatcher; failures surface on the
    /// recoverable-error callback tagged with `id`.
    SendDeferred { msg: Msg, conn: Arc<Conn>, id: i32 },
    /// Tear everything down and exit the dispatcher.
    Stop { reply: oneshot::Sender<()> },
}

/// Events posted to the dispatcher by I/O and accept tasks.
pub(crate) enum EngineEvent {
    Accepted { stream: TcpStream, addr: SocketAddr },
    ConnectDone {
        conn: Arc<Conn>,
        result: std::io::Result<TcpStream>,
    },
    Teardown {
        conn: Arc<Conn>,
        error: Option<NetError>,
    },
}

/// Notifications drained by the delivery task and turned into user
/// callbacks.
pub(crate) enum UserEvent {
    Conn(Arc<Conn>, bool),
    Peer(Arc<Conn>, bool),
    UnknownPeer(SocketAddr, Option<Bytes>),
    Error {
        err: NetError,
        fatal: bool,
        async_id: Option<i32>,
    },
}

/// Hooks a network variant installs into the dispatcher.
///
/// All three methods run on the dispatcher task, so an overlay may mutate
/// its own state and the pool without further synchronization.
pub(crate) trait Overlay: Send + 'static {
    /// Variant-specific commands routed through the dispatcher.
    type Cmd: Send + 'static;

    fn on_setup(&mut self, core: &mut PoolCore, conn: &Arc<Conn>);
    fn on_teardown(&mut self, core: &mut PoolCore, conn: &Arc<Conn>);
    fn on_cmd(&mut self, core: &mut PoolCore, cmd: Self::Cmd);
}

/// Overlay for the plain message network: no extra state, no extra hooks.
pub(crate) struct NullOverlay;

impl Overlay for NullOverlay {
    type Cmd = std::convert::Infallible;

    fn on_setup(&mut self, _core: &mut PoolCore, _conn: &Arc<Conn>) {}
    fn on_teardown(&mut self, _core: &mut PoolCore, _conn: &Arc<Conn>) {}
    fn on_cmd(&mut self, _core: &mut PoolCore, cmd: Self::Cmd) {
        match cmd {}
    }
}

/// A worker shard: the accounting unit for least-loaded connection
/// assignment. I/O task scheduling is delegated to the runtime; the shard
/// keeps the live-connection count that drives assignment.
struct WorkerShard {
    nconn: usize,
}

/// Dispatcher-owned pool state.
pub(crate) struct PoolCore {
    cfg: MsgNetConfig,
    read_timeout: Option<Duration>,
    pool: HashMap<u64, Arc<Conn>>,
    workers: Vec<WorkerShard>,
    next_conn_id: u64,
    listener: Option<JoinHandle<()>>,
    inbound_tx: mpsc::Sender<(Msg, Arc<Conn>)>,
    pub(crate) user_tx: mpsc::UnboundedSender<UserEvent>,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
}

impl PoolCore {
    pub(crate) fn new(
        cfg: MsgNetConfig,
        read_timeout: Option<Duration>,
        inbound_tx: mpsc::Sender<(Msg, Arc<Conn>)>,
        user_tx: mpsc::UnboundedSender<UserEvent>,
        event_tx: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        let nworker = cfg.nworker.max(1);
        Self {
            cfg,
            read_timeout,
            pool: HashMap::new(),
            workers: (0..nworker).map(|_| WorkerShard { nconn: 0 }).collect(),
            next_conn_id: 0,
            listener: None,
            inbound_tx,
            user_tx,
            event_tx,
        }
    }

    pub(crate) fn msg_magic(&self) -> u32 {
        self.cfg.msg_magic
    }

    /// Index of the worker shard with the fewest live connections.
    fn select_worker(&self) -> usize {
        let mut idx = 0;
        let mut best = self.workers[0].nconn;
        for (i, worker) in self.workers.iter().enumerate() {
            if worker.nconn < best {
                best = worker.nconn;
                idx = i;
            }
        }
        idx
    }

    fn new_conn(&mut self, addr: SocketAddr, mode: ConnMode) -> Arc<Conn> {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        let worker = self.select_worker();
        let conn = Conn::new(id, addr, mode, worker, self.cfg.queue_capacity);
        self.workers[worker].nconn += 1;
        self.pool.insert(id, conn.clone());
        conn
    }

    /// Create an active connection and start the dial in the background.
    /// The TCP connect is bounded by `conn_server_timeout`.
    pub(crate) fn open_active(&mut self, addr: SocketAddr) -> Arc<Conn> {
        let conn = self.new_conn(addr, ConnMode::Active);
        debug!("dialing {conn}");
        let event_tx = self.event_tx.clone();
        let deadline = self.cfg.conn_server_timeout;
        let handle = conn.clone();
        tokio::spawn(async move {
            let result = match timeout(deadline, TcpStream::connect(addr)).await {
                Ok(res) => res,
                Err(_) => Err(std::io::ErrorKind::TimedOut.into()),
            };
            let _ = event_tx.send(EngineEvent::ConnectDone {
                conn: handle,
                result,
            });
        });
        conn
    }

    /// Hand an established stream to the connection's worker shard: spawn
    /// the reader and writer tasks that own the socket halves.
    fn feed(&mut self, conn: &Arc<Conn>, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        let (rd, wr) = stream.into_split();
        let params = ReaderParams {
            seg_buff_size: self.cfg.seg_buff_size,
            msg_magic: self.cfg.msg_magic,
            max_msg_size: self.cfg.max_msg_size,
            read_timeout: self.read_timeout,
        };
        let reader = tokio::spawn(reader_task(
            conn.clone(),
            rd,
            params,
            self.inbound_tx.clone(),
            self.event_tx.clone(),
        ));
        let writer = tokio::spawn(writer_task(conn.clone(), wr, self.event_tx.clone()));
        conn.io_tasks.lock().extend([reader, writer]);
        debug!("worker {} got {conn}", conn.worker());
    }

    fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr> {
        if self.listener.is_some() {
            return Err(NetError::ListenerAlreadyStarted);
        }
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(self.cfg.max_listen_backlog)?;
        let local = listener.local_addr()?;
        let event_tx = self.event_tx.clone();
        self.listener = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if event_tx.send(EngineEvent::Accepted { stream, addr }).is_err() {
                            break;
                        }
                    }
                    Err(err) => error!("accept error: {err}"),
                }
            }
        }));
        info!("listening on {local}");
        Ok(local)
    }

    /// Kill a connection from the dispatcher side. Finalization happens on a
    /// later dispatcher iteration so overlay hooks never re-enter.
    pub(crate) fn disp_terminate(&self, conn: &Arc<Conn>) {
        if conn.kill() {
            let _ = self.event_tx.send(EngineEvent::Teardown {
                conn: conn.clone(),
                error: None,
            });
        }
    }

    /// Emit a recoverable error tagged with a deferred call's async id.
    pub(crate) fn recoverable(&self, err: NetError, id: i32) {
        let _ = self.user_tx.send(UserEvent::Error {
            err,
            fatal: false,
            async_id: Some(id),
        });
    }

    /// Emit an untagged error on the fatal or recoverable channel.
    pub(crate) fn report(&self, err: NetError, fatal: bool) {
        let _ = self.user_tx.send(UserEvent::Error {
            err,
            fatal,
            async_id: None,
        });
    }
}

// ── Dispatcher loop ─────────────────────────────────────────────────────────

fn setup<O: Overlay>(core: &mut PoolCore, overlay: &mut O, conn: &Arc<Conn>) {
    conn.setup_done.store(true, Ordering::Release);
    overlay.on_setup(core, conn);
    let _ = core.user_tx.send(UserEvent::Conn(conn.clone(), true));
}

/// Erase a dead connection from the pool and run the teardown hooks.
/// The pool entry is the exactly-once guard.
fn finalize<O: Overlay>(
    core: &mut PoolCore,
    overlay: &mut O,
    conn: &Arc<Conn>,
    error: Option<NetError>,
) {
    if core.pool.remove(&conn.id()).is_none() {
        return;
    }
    conn.kill();
    for task in conn.io_tasks.lock().drain(..) {
        task.abort();
    }
    core.workers[conn.worker()].nconn -= 1;
    match &error {
        Some(err) => info!("{conn} torn down: {err}"),
        None => info!("{conn} torn down"),
    }
    overlay.on_teardown(core, conn);
    if conn.setup_done.load(Ordering::Acquire) {
        let _ = core.user_tx.send(UserEvent::Conn(conn.clone(), false));
    }
}

fn handle_event<O: Overlay>(core: &mut PoolCore, overlay: &mut O, event: EngineEvent) {
    match event {
        EngineEvent::Accepted { stream, addr } => {
            let conn = core.new_conn(addr, ConnMode::Passive);
            info!("accepted {conn}");
            core.feed(&conn, stream);
            setup(core, overlay, &conn);
        }
        EngineEvent::ConnectDone { conn, result } => {
            if conn.is_terminated() {
                // Terminated while dialing; the stream (if any) just drops.
                return;
            }
            match result {
                Ok(stream) => {
                    info!("connected {conn}");
                    core.feed(&conn, stream);
                    setup(core, overlay, &conn);
                }
                Err(err) => {
                    warn!("{conn}: connect failed: {err}");
                    core.report(NetError::Io(err), false);
                    core.disp_terminate(&conn);
                }
            }
        }
        EngineEvent::Teardown { conn, error } => finalize(core, overlay, &conn, error),
    }
}

fn handle_cmd<O: Overlay>(core: &mut PoolCore, _overlay: &mut O, cmd: Cmd) {
    match cmd {
        Cmd::Connect { addr, reply } => {
            let conn = core.open_active(addr);
            let _ = reply.send(conn);
        }
        Cmd::ConnectNb { addr } => {
            core.open_active(addr);
        }
        Cmd::Listen { addr, reply } => {
            let _ = reply.send(core.listen(addr));
        }
        Cmd::Terminate { conn } => core.disp_terminate(&conn),
        Cmd::SendDeferred { msg, conn, id } => {
            let len = msg.len();
            let data = msg.encode(core.cfg.msg_magic);
            if conn.write_chunk(data) {
                conn.stats().record_sent(len);
            } else {
                core.recoverable(NetError::ConnNotReady, id);
            }
        }
        Cmd::Stop { .. } => unreachable!("Stop is handled by the dispatcher loop"),
    }
}

fn stop_all<O: Overlay>(core: &mut PoolCore, overlay: &mut O) {
    info!("stopping network");
    if let Some(task) = core.listener.take() {
        task.abort();
    }
    let conns: Vec<_> = core.pool.values().cloned().collect();
    for conn in conns {
        conn.kill();
        finalize(core, overlay, &conn, None);
    }
}

/// The dispatcher task body. Runs until `stop()` or until every handle is
/// dropped, then tears down all remaining connections.
pub(crate) async fn run_dispatcher<O: Overlay>(
    mut core: PoolCore,
    mut overlay: O,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    mut ext_rx: mpsc::UnboundedReceiver<O::Cmd>,
    mut event_rx: mpsc::UnboundedReceiver<EngineEvent>,
) {
    loop {
        tokio::select! {
            biased;
            event = event_rx.recv() => match event {
                Some(event) => handle_event(&mut core, &mut overlay, event),
                None => break,
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(Cmd::Stop { reply }) => {
                    stop_all(&mut core, &mut overlay);
                    let _ = reply.send(());
                    return;
                }
                Some(cmd) => handle_cmd(&mut core, &mut overlay, cmd),
                None => break,
            },
            ext = ext_rx.recv() => match ext {
                Some(cmd) => overlay.on_cmd(&mut core, cmd),
                None => break,
            },
        }
    }
    stop_all(&mut core, &mut overlay);
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_core(nworker: usize) -> PoolCore {
        let (inbound_tx, _inbound_rx) = mpsc::channel(16);
        let (user_tx, _user_rx) = mpsc::unbounded_channel();
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let cfg = MsgNetConfig {
            nworker,
            ..MsgNetConfig::dev_default()
        };
        PoolCore::new(cfg, None, inbound_tx, user_tx, event_tx)
    }

    #[test]
    fn test_select_worker_least_loaded() {
        let mut core = test_core(3);
        core.workers[0].nconn = 4;
        core.workers[1].nconn = 1;
        core.workers[2].nconn = 2;
        assert_eq!(core.select_worker(), 1);
        // Ties resolve to the first shard with the minimum.
        core.workers[1].nconn = 2;
        core.workers[2].nconn = 2;
        assert_eq!(core.select_worker(), 1);
    }

    #[test]
    fn test_nworker_clamped_to_one() {
        let core = test_core(0);
        assert_eq!(core.workers.len(), 1);
    }

    #[tokio::test]
    async fn test_new_conn_round_robins_by_load() {
        let mut core = test_core(2);
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let a = core.new_conn(addr, ConnMode::Active);
        let b = core.new_conn(addr, ConnMode::Active);
        assert_ne!(a.worker(), b.worker());
        assert_eq!(core.pool.len(), 2);
        assert_ne!(a.id(), b.id());
    }
}
