//! Connection object and per-connection I/O tasks.
//!
//! A [`Conn`] owns one bi-directional byte stream plus its framing state.
//! The dispatcher creates it and assigns it to a worker shard; a reader task
//! and a writer task drive the socket halves. The dispatcher only ever
//! touches a live connection through posted commands — the I/O tasks are the
//! sole users of the socket.
//!
//! Teardown converges from two directions: the I/O tasks kill the connection
//! on read/write errors, oversized frames, or liveness expiry
//! (`worker_terminate`), and the dispatcher kills it on explicit terminate or
//! peer eviction. Whoever flips the mode to `Dead` first wins; the
//! dispatcher-side finalizer runs exactly once either way.

use {
    crate::{
        error::NetError,
        msg::{FrameParser, Msg},
        peer_net::PeerId,
        pool::EngineEvent,
    },
    bytes::{Bytes, BytesMut},
    log::{debug, warn},
    parking_lot::Mutex,
    std::{
        collections::VecDeque,
        fmt,
        net::SocketAddr,
        sync::{
            atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::tcp::{OwnedReadHalf, OwnedWriteHalf},
        sync::{mpsc, Notify},
        task::JoinHandle,
        time::timeout,
    },
};

/// Connection lifecycle mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnMode {
    /// Established by an active dial.
    Active,
    /// Established by the passive listener.
    Passive,
    /// Terminated; absorbs all further events.
    Dead,
}

const MODE_ACTIVE: u8 = 0;
const MODE_PASSIVE: u8 = 1;
const MODE_DEAD: u8 = 2;

/// Per-connection traffic counters.
#[derive(Debug, Default)]
pub struct ConnStats {
    nsent: AtomicU64,
    nrecv: AtomicU64,
    nsentb: AtomicU64,
    nrecvb: AtomicU64,
}

impl ConnStats {
    pub(crate) fn record_sent(&self, bytes: usize) {
        self.nsent.fetch_add(1, Ordering::Relaxed);
        self.nsentb.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_recv(&self, bytes: usize) {
        self.nrecv.fetch_add(1, Ordering::Relaxed);
        self.nrecvb.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Messages sent on this connection.
    pub fn nsent(&self) -> u64 {
        self.nsent.load(Ordering::Relaxed)
    }

    /// Messages delivered from this connection.
    pub fn nrecv(&self) -> u64 {
        self.nrecv.load(Ordering::Relaxed)
    }

    /// Payload bytes sent.
    pub fn nsentb(&self) -> u64 {
        self.nsentb.load(Ordering::Relaxed)
    }

    /// Payload bytes delivered.
    pub fn nrecvb(&self) -> u64 {
        self.nrecvb.load(Ordering::Relaxed)
    }
}

/// MPSC write queue with readiness signaling.
///
/// Producers push serialized chunks from any thread; the single writer task
/// drains them in push order. A push into an empty queue wakes the writer.
/// With a positive capacity the queue is bounded and `push` fails when full;
/// capacity 0 means unbounded.
pub(crate) struct SendBuffer {
    queue: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    capacity: usize,
}

impl SendBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Append a chunk. Returns false if the queue is bounded and full.
    pub(crate) fn push(&self, chunk: Bytes) -> bool {
        {
            let mut queue = self.queue.lock();
            if self.capacity > 0 && queue.len() >= self.capacity {
                return false;
            }
            queue.push_back(chunk);
        }
        self.notify.notify_one();
        true
    }

    pub(crate) fn pop(&self) -> Option<Bytes> {
        self.queue.lock().pop_front()
    }

    /// Take every queued chunk, preserving order. Used when a reset peer
    /// channel hands its unsent bytes to the replacement connection.
    pub(crate) fn drain(&self) -> Vec<Bytes> {
        self.queue.lock().drain(..).collect()
    }

    /// Wait until the queue is non-empty.
    pub(crate) async fn ready(&self) {
        loop {
            if !self.queue.lock().is_empty() {
                return;
            }
            self.notify.notified().await;
        }
    }
}

/// One bi-directional connection plus framing state.
///
/// Handles are `Arc<Conn>`; identity is pointer identity. The pool keeps one
/// strong reference while the connection is alive and drops it on teardown,
/// so reclamation follows naturally once outside handles go away.
pub struct Conn {
    id: u64,
    addr: SocketAddr,
    mode: AtomicU8,
    worker: usize,
    pub(crate) send_buf: SendBuffer,
    pub(crate) msg_sleep: AtomicBool,
    /// Non-owning back-pointer to the peer this connection is a candidate or
    /// chosen channel for. Cleared when the connection loses the handshake
    /// race or the peer is removed.
    pub(crate) peer: Mutex<Option<PeerId>>,
    peer_cert: Mutex<Option<Bytes>>,
    pub(crate) setup_done: AtomicBool,
    stats: ConnStats,
    pub(crate) io_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Conn {
    pub(crate) fn new(
        id: u64,
        addr: SocketAddr,
        mode: ConnMode,
        worker: usize,
        queue_capacity: usize,
    ) -> Arc<Self> {
        let mode = match mode {
            ConnMode::Active => MODE_ACTIVE,
            ConnMode::Passive => MODE_PASSIVE,
            ConnMode::Dead => MODE_DEAD,
        };
        Arc::new(Self {
            id,
            addr,
            mode: AtomicU8::new(mode),
            worker,
            send_buf: SendBuffer::new(queue_capacity),
            msg_sleep: AtomicBool::new(false),
            peer: Mutex::new(None),
            peer_cert: Mutex::new(None),
            setup_done: AtomicBool::new(false),
            stats: ConnStats::default(),
            io_tasks: Mutex::new(Vec::new()),
        })
    }

    /// Pool identifier of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current lifecycle mode.
    pub fn mode(&self) -> ConnMode {
        match self.mode.load(Ordering::Acquire) {
            MODE_ACTIVE => ConnMode::Active,
            MODE_PASSIVE => ConnMode::Passive,
            _ => ConnMode::Dead,
        }
    }

    /// Whether the connection has been terminated.
    pub fn is_terminated(&self) -> bool {
        self.mode.load(Ordering::Acquire) == MODE_DEAD
    }

    /// Whether inbound processing is currently paused on queue backpressure.
    pub fn recv_paused(&self) -> bool {
        self.msg_sleep.load(Ordering::Acquire)
    }

    /// The DER-encoded certificate presented by the remote transport, when a
    /// certificate-bearing transport is layered in.
    pub fn peer_cert(&self) -> Option<Bytes> {
        self.peer_cert.lock().clone()
    }

    /// Record the remote transport certificate. Must be called before the
    /// peer handshake runs for certificate-based identities to take effect.
    pub fn set_peer_cert(&self, der: Bytes) {
        *self.peer_cert.lock() = Some(der);
    }

    /// Traffic counters for this connection.
    pub fn stats(&self) -> &ConnStats {
        &self.stats
    }

    pub(crate) fn worker(&self) -> usize {
        self.worker
    }

    /// Flip the mode to `Dead`. Returns true for the caller that won the
    /// transition; later callers see false and must not re-finalize.
    pub(crate) fn kill(&self) -> bool {
        loop {
            let cur = self.mode.load(Ordering::Acquire);
            if cur == MODE_DEAD {
                return false;
            }
            if self
                .mode
                .compare_exchange(cur, MODE_DEAD, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Queue serialized bytes for sending. Returns false when the connection
    /// is dead or its bounded send queue is full.
    pub(crate) fn write_chunk(&self, chunk: Bytes) -> bool {
        if self.is_terminated() {
            return false;
        }
        self.send_buf.push(chunk)
    }
}

impl fmt::Display for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode() {
            ConnMode::Active => "active",
            ConnMode::Passive => "passive",
            ConnMode::Dead => "dead",
        };
        write!(f, "conn #{} ({}) {}", self.id, mode, self.addr)
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// ── I/O tasks ───────────────────────────────────────────────────────────────

/// Kill the connection from an I/O task and hand finalization to the
/// dispatcher. A connection already dead absorbs the event silently.
fn worker_terminate(
    conn: &Arc<Conn>,
    event_tx: &mpsc::UnboundedSender<EngineEvent>,
    error: Option<NetError>,
) {
    if conn.kill() {
        let _ = event_tx.send(EngineEvent::Teardown {
            conn: conn.clone(),
            error,
        });
    }
}

pub(crate) struct ReaderParams {
    pub seg_buff_size: usize,
    pub msg_magic: u32,
    pub max_msg_size: usize,
    /// Per-read liveness deadline; any received byte resets it. Set by the
    /// peer overlay, absent for plain message/client networks.
    pub read_timeout: Option<Duration>,
}

/// Read socket bytes into the recv buffer and feed complete frames to the
/// bounded inbound queue. Suspends on queue capacity (observable through
/// [`Conn::recv_paused`]) which in turn engages TCP flow control.
pub(crate) async fn reader_task(
    conn: Arc<Conn>,
    mut rd: OwnedReadHalf,
    params: ReaderParams,
    inbound_tx: mpsc::Sender<(Msg, Arc<Conn>)>,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
) {
    let mut parser = FrameParser::new(params.msg_magic, params.max_msg_size);
    let mut buf = BytesMut::with_capacity(params.seg_buff_size);

    loop {
        // Drain every complete frame before reading more.
        loop {
            match parser.next_frame(&mut buf) {
                Ok(Some(msg)) => {
                    let item = (msg, conn.clone());
                    let pushed = match inbound_tx.try_send(item) {
                        Ok(()) => true,
                        Err(mpsc::error::TrySendError::Full(item)) => {
                            conn.msg_sleep.store(true, Ordering::Release);
                            let sent = inbound_tx.send(item).await.is_ok();
                            conn.msg_sleep.store(false, Ordering::Release);
                            sent
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => false,
                    };
                    if !pushed {
                        // The network is stopping; teardown follows from stop().
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!("{conn}: {err}, terminating the connection");
                    worker_terminate(&conn, &event_tx, Some(err));
                    return;
                }
            }
        }

        buf.reserve(params.seg_buff_size);
        let n = if let Some(deadline) = params.read_timeout {
            match timeout(deadline, rd.read_buf(&mut buf)).await {
                Ok(res) => res,
                Err(_) => {
                    debug!("{conn}: liveness deadline expired");
                    worker_terminate(
                        &conn,
                        &event_tx,
                        Some(NetError::Io(std::io::ErrorKind::TimedOut.into())),
                    );
                    return;
                }
            }
        } else {
            rd.read_buf(&mut buf).await
        };

        match n {
            Ok(0) => {
                debug!("{conn}: closed by remote");
                worker_terminate(&conn, &event_tx, None);
                return;
            }
            Ok(_) => {}
            Err(err) => {
                debug!("{conn}: read error: {err}");
                worker_terminate(&conn, &event_tx, Some(err.into()));
                return;
            }
        }
    }
}

/// Drain the send buffer to the socket in FIFO order, waking on the
/// buffer's non-empty signal.
pub(crate) async fn writer_task(
    conn: Arc<Conn>,
    mut wr: OwnedWriteHalf,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
) {
    loop {
        conn.send_buf.ready().await;
        while let Some(chunk) = conn.send_buf.pop() {
            if let Err(err) = wr.write_all(&chunk).await {
                debug!("{conn}: write error: {err}");
                worker_terminate(&conn, &event_tx, Some(err.into()));
                return;
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn(queue_capacity: usize) -> Arc<Conn> {
        Conn::new(
            1,
            "127.0.0.1:9000".parse().unwrap(),
            ConnMode::Active,
            0,
            queue_capacity,
        )
    }

    #[test]
    fn test_send_buffer_fifo() {
        let buf = SendBuffer::new(0);
        assert!(buf.push(Bytes::from_static(b"a")));
        assert!(buf.push(Bytes::from_static(b"b")));
        assert_eq!(buf.pop().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(buf.pop().unwrap(), Bytes::from_static(b"b"));
        assert!(buf.pop().is_none());
    }

    #[test]
    fn test_send_buffer_capacity_boundary() {
        let buf = SendBuffer::new(2);
        assert!(buf.push(Bytes::from_static(b"1")));
        assert!(buf.push(Bytes::from_static(b"2")));
        // The K+1-th push fails.
        assert!(!buf.push(Bytes::from_static(b"3")));
        // After a drain the queue accepts again.
        buf.pop();
        assert!(buf.push(Bytes::from_static(b"3")));
    }

    #[test]
    fn test_send_buffer_unbounded() {
        let buf = SendBuffer::new(0);
        for i in 0..10_000u32 {
            assert!(buf.push(Bytes::from(i.to_le_bytes().to_vec())));
        }
    }

    #[test]
    fn test_send_buffer_drain_preserves_order() {
        let buf = SendBuffer::new(0);
        buf.push(Bytes::from_static(b"x"));
        buf.push(Bytes::from_static(b"y"));
        let drained = buf.drain();
        assert_eq!(
            drained,
            vec![Bytes::from_static(b"x"), Bytes::from_static(b"y")]
        );
        assert!(buf.pop().is_none());
    }

    #[test]
    fn test_kill_wins_exactly_once() {
        let conn = test_conn(0);
        assert_eq!(conn.mode(), ConnMode::Active);
        assert!(conn.kill());
        assert!(!conn.kill());
        assert_eq!(conn.mode(), ConnMode::Dead);
        assert!(conn.is_terminated());
    }

    #[test]
    fn test_dead_conn_rejects_writes() {
        let conn = test_conn(0);
        assert!(conn.write_chunk(Bytes::from_static(b"ok")));
        conn.kill();
        assert!(!conn.write_chunk(Bytes::from_static(b"nope")));
    }

    #[tokio::test]
    async fn test_send_buffer_ready_wakes_on_push() {
        let buf = Arc::new(SendBuffer::new(0));
        let waiter = {
            let buf = buf.clone();
            tokio::spawn(async move {
                buf.ready().await;
            })
        };
        tokio::task::yield_now().await;
        buf.push(Bytes::from_static(b"wake"));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("ready() should wake after push")
            .unwrap();
    }
}
