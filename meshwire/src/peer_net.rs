//! Peer-to-peer overlay: peer registry, handshake, liveness, reconnect.
//!
//! Any two registered peers converge on exactly one bi-directional channel,
//! even when both sides dial simultaneously. The symmetry break works like
//! this: each side carries a lazily drawn 16-bit nonce for the current
//! handshake round. An active dialer sends `Ping(listen_addr, nonce)`; the
//! passive side answers `Pong(listen_addr, nonce)`. Each side then compares
//! the remote nonce with its own — the side with the smaller nonce keeps its
//! outbound connection and the other side keeps its inbound one. Ties (about
//! 2⁻¹⁶ per round) terminate both attempts, reset the nonces, and retry.
//!
//! Once a channel is chosen, a jittered ping timer exchanges heartbeats; a
//! connection silent for `conn_timeout` is torn down and the peer reconnects
//! according to its retry policy.
//!
//! All state transitions below run on the dispatcher task. Handshake frames
//! arrive through the normal inbound queue; the registered ping/pong
//! handlers bounce them back to the dispatcher as overlay commands.

use {
    crate::{
        config::{IdentityMode, PeerNetConfig},
        conn::{Conn, ConnMode},
        error::{NetError, Result},
        msg::Msg,
        msg_net::{spawn_net, Callbacks, NetBase},
        pool::{Overlay, PoolCore, UserEvent},
    },
    bytes::{Buf, BufMut, Bytes, BytesMut},
    log::{debug, info, warn},
    parking_lot::RwLock,
    rand::Rng,
    std::{
        collections::HashMap,
        fmt,
        net::{Ipv4Addr, SocketAddr},
        sync::Arc,
        time::Duration,
    },
    tokio::sync::{mpsc, oneshot},
};

/// Nonce sent by a passive side that does not know its peer's address yet.
/// Regular nonces are drawn from `1..=0xfffe`, so the sentinel always loses
/// against a drawn nonce and the dialing side's view stays deterministic.
const PASSIVE_NONCE: u32 = 0xffff;

/// 256-bit peer identity fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Derive an identity from a network address.
    pub fn from_addr(addr: &SocketAddr) -> Self {
        use sha2::{Digest, Sha256};
        let mut buf = BytesMut::new();
        put_addr(&mut buf, addr);
        Self(Sha256::digest(&buf).into())
    }

    /// Derive an identity from a DER-encoded transport certificate.
    pub fn from_cert_der(der: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        Self(Sha256::digest(der).into())
    }

    /// The raw fingerprint bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..5] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")?;
        Ok(())
    }
}

// ── Handshake wire format ───────────────────────────────────────────────────

fn put_addr(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.ip().octets());
            buf.put_u16_le(v4.port());
        }
        SocketAddr::V6(v6) => {
            buf.put_u8(6);
            buf.put_slice(&v6.ip().octets());
            buf.put_u16_le(v6.port());
        }
    }
}

fn read_addr(buf: &mut &[u8]) -> Option<SocketAddr> {
    if buf.remaining() < 1 {
        return None;
    }
    match buf.get_u8() {
        4 => {
            if buf.remaining() < 6 {
                return None;
            }
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16_le();
            Some(SocketAddr::from((octets, port)))
        }
        6 => {
            if buf.remaining() < 18 {
                return None;
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16_le();
            Some(SocketAddr::from((octets, port)))
        }
        _ => None,
    }
}

/// Payload of a Ping or Pong frame.
///
/// A leading flag byte distinguishes the two shapes: `0` is a bare
/// heartbeat, `1` is a handshake carrying the sender's claimed listen
/// address and handshake nonce (u32 little-endian).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub claimed_addr: Option<SocketAddr>,
    pub nonce: u32,
}

impl Handshake {
    pub(crate) fn heartbeat() -> Self {
        Self {
            claimed_addr: None,
            nonce: 0,
        }
    }

    pub(crate) fn hello(claimed_addr: SocketAddr, nonce: u32) -> Self {
        Self {
            claimed_addr: Some(claimed_addr),
            nonce,
        }
    }

    pub(crate) fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self.claimed_addr {
            None => buf.put_u8(0),
            Some(addr) => {
                buf.put_u8(1);
                put_addr(&mut buf, &addr);
                buf.put_u32_le(self.nonce);
            }
        }
        buf.freeze()
    }

    pub(crate) fn decode(data: &[u8]) -> Option<Self> {
        let mut buf = data;
        if buf.remaining() < 1 {
            return None;
        }
        if buf.get_u8() == 0 {
            return Some(Self::heartbeat());
        }
        let claimed_addr = read_addr(&mut buf)?;
        if buf.remaining() < 4 {
            return None;
        }
        let nonce = buf.get_u32_le();
        Some(Self {
            claimed_addr: Some(claimed_addr),
            nonce,
        })
    }
}

// ── Peer state ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Disconnected,
    Connected,
    /// A user-initiated reset: the established channel is being torn down
    /// and the reconnect fires immediately rather than after the retry
    /// delay.
    Reset,
}

/// Registry entry for one configured peer.
struct Peer {
    addr: Option<SocketAddr>,
    /// Current handshake nonce; 0 means "not drawn yet".
    nonce: u32,
    /// The chosen channel once the handshake completes. Kept after teardown
    /// (dead) so a replacement channel can inherit its unsent bytes.
    conn: Option<Arc<Conn>>,
    inbound_conn: Option<Arc<Conn>>,
    outbound_conn: Option<Arc<Conn>>,
    /// Remaining connection attempts: -1 = infinite, 0 = give up.
    ntry: i32,
    retry_delay: Duration,
    ping_timer_ok: bool,
    pong_msg_ok: bool,
    state: PeerState,
    /// Generation counter for this peer's timers; bumping it cancels every
    /// outstanding ping/retry timer.
    timer_gen: u64,
    retry_armed: bool,
    /// Test hook: a pinned nonce wins over the lazy draw.
    #[cfg(feature = "dev-context-only-utils")]
    pinned_nonce: Option<u32>,
}

impl Peer {
    fn new() -> Self {
        Self {
            addr: None,
            nonce: 0,
            conn: None,
            inbound_conn: None,
            outbound_conn: None,
            ntry: 0,
            retry_delay: Duration::from_secs(2),
            ping_timer_ok: false,
            pong_msg_ok: false,
            state: PeerState::Disconnected,
            timer_gen: 0,
            retry_armed: false,
            #[cfg(feature = "dev-context-only-utils")]
            pinned_nonce: None,
        }
    }

    /// The nonce for the current handshake round, drawn lazily. Fails with
    /// `RandSource` when the OS entropy source does.
    fn get_nonce(&mut self) -> Result<u32> {
        #[cfg(feature = "dev-context-only-utils")]
        if let Some(nonce) = self.pinned_nonce {
            return Ok(nonce);
        }
        if self.nonce == 0 {
            self.nonce = draw_nonce()?;
        }
        Ok(self.nonce)
    }
}

/// Draw a fresh 16-bit handshake nonce from the OS entropy source, mapped
/// into `1..=0xfffe` so the passive sentinel stays reserved.
fn draw_nonce() -> Result<u32> {
    use rand::TryRngCore;
    let mut bytes = [0u8; 2];
    rand::rngs::OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|_| NetError::RandSource)?;
    Ok(u32::from(u16::from_le_bytes(bytes)) % 0xfffe + 1)
}

type PeerMap = Arc<RwLock<HashMap<PeerId, Peer>>>;

fn rand_jitter(base: Duration) -> Duration {
    base.mul_f64(0.5 + rand::rng().random::<f64>())
}

fn unspecified_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
}

// ── Overlay commands ────────────────────────────────────────────────────────

pub(crate) enum PeerCmd {
    AddPeer {
        pid: PeerId,
        id: i32,
    },
    SetPeerAddr {
        pid: PeerId,
        addr: SocketAddr,
        id: i32,
    },
    ConnPeer {
        pid: PeerId,
        ntry: i32,
        retry_delay: Duration,
        id: i32,
    },
    DelPeer {
        pid: PeerId,
        id: i32,
    },
    SetListenAddr {
        addr: SocketAddr,
    },
    Ping {
        hs: Handshake,
        conn: Arc<Conn>,
    },
    Pong {
        hs: Handshake,
        conn: Arc<Conn>,
    },
    PingTimer {
        pid: PeerId,
        gen: u64,
    },
    RetryTimer {
        pid: PeerId,
        gen: u64,
    },
    GetNPending {
        reply: oneshot::Sender<usize>,
    },
    SendDeferred {
        pid: PeerId,
        msg: Msg,
        id: i32,
    },
    Multicast {
        pids: Vec<PeerId>,
        msg: Msg,
        id: i32,
    },
    #[cfg(feature = "dev-context-only-utils")]
    PinNonce { pid: PeerId, nonce: Option<u32> },
}

// ── Overlay implementation ──────────────────────────────────────────────────

struct PeerOverlay {
    cfg: PeerNetConfig,
    peers: PeerMap,
    /// Connections whose peer identity is not yet bound, keyed by remote
    /// address.
    pending: HashMap<SocketAddr, Arc<Conn>>,
    listen_addr: Option<SocketAddr>,
    ext_tx: mpsc::UnboundedSender<PeerCmd>,
}

impl PeerOverlay {
    fn listen_addr(&self) -> SocketAddr {
        self.listen_addr.unwrap_or_else(unspecified_addr)
    }

    fn get_peer_id(&self, conn: &Arc<Conn>, addr: SocketAddr) -> PeerId {
        match self.cfg.id_mode {
            IdentityMode::CertBased => match conn.peer_cert() {
                Some(der) => PeerId::from_cert_der(&der),
                None => PeerId::from_addr(&addr),
            },
            IdentityMode::AddrBased => PeerId::from_addr(&addr),
        }
    }

    fn send_handshake(&self, core: &PoolCore, opcode: u8, hs: &Handshake, conn: &Arc<Conn>) {
        let msg = Msg::new(opcode, hs.encode());
        let len = msg.len();
        if conn.write_chunk(msg.encode(core.msg_magic())) {
            conn.stats().record_sent(len);
        }
    }

    fn replace_pending(&mut self, core: &PoolCore, conn: &Arc<Conn>) {
        if let Some(old) = self.pending.get(&conn.addr()) {
            if !Arc::ptr_eq(old, conn) {
                debug!("terminating stale handshake connection {old}");
                core.disp_terminate(&old.clone());
            }
        }
        self.pending.insert(conn.addr(), conn.clone());
    }

    fn start_active_conn(&mut self, core: &mut PoolCore, p: &mut Peer, pid: PeerId) {
        let Some(addr) = p.addr else {
            return;
        };
        let conn = core.open_active(addr);
        *conn.peer.lock() = Some(pid);
        p.outbound_conn = Some(conn.clone());
        self.replace_pending(core, &conn);
        debug!("peer {pid}: dialing {addr}");
    }

    fn arm_ping_timer(&self, p: &mut Peer, pid: PeerId) {
        let gen = p.timer_gen;
        let delay = rand_jitter(self.cfg.ping_period);
        let ext_tx = self.ext_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = ext_tx.send(PeerCmd::PingTimer { pid, gen });
        });
    }

    /// Schedule a reconnect attempt per the peer's retry policy. The retry
    /// counter is consumed here; `immediate` skips the jittered delay after
    /// a user-initiated reset.
    fn arm_retry(&self, p: &mut Peer, pid: PeerId, immediate: bool) {
        if p.retry_armed {
            return;
        }
        if p.ntry > 0 {
            p.ntry -= 1;
        }
        if p.ntry == 0 {
            return;
        }
        p.retry_armed = true;
        let gen = p.timer_gen;
        let delay = if immediate {
            Duration::ZERO
        } else {
            rand_jitter(p.retry_delay)
        };
        debug!("peer {pid}: retry in {delay:?} ({} tries left)", p.ntry);
        let ext_tx = self.ext_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = ext_tx.send(PeerCmd::RetryTimer { pid, gen });
        });
    }

    fn send_ping(&self, core: &PoolCore, p: &mut Peer) {
        p.ping_timer_ok = false;
        p.pong_msg_ok = false;
        if let Some(conn) = &p.conn {
            self.send_handshake(core, self.cfg.ping_opcode, &Handshake::heartbeat(), conn);
        }
    }

    /// Conclude the handshake: `chosen` becomes the peer's single channel.
    fn finish_handshake(
        &mut self,
        core: &mut PoolCore,
        p: &mut Peer,
        pid: PeerId,
        chosen: Arc<Conn>,
    ) {
        debug_assert_eq!(p.state, PeerState::Disconnected);
        // Cancel every outstanding peer timer.
        p.timer_gen += 1;
        p.retry_armed = false;
        // Losing candidates drop their back-pointers so their teardown does
        // not touch this peer again.
        for cand in [p.inbound_conn.take(), p.outbound_conn.take()]
            .into_iter()
            .flatten()
        {
            if !Arc::ptr_eq(&cand, &chosen) {
                *cand.peer.lock() = None;
            }
        }
        p.state = PeerState::Connected;
        self.arm_ping_timer(p, pid);

        let old = p.conn.take();
        p.conn = Some(chosen.clone());
        *chosen.peer.lock() = Some(pid);
        self.send_ping(core, p);
        if let Some(old) = old {
            if !Arc::ptr_eq(&old, &chosen) {
                // Hand the dead channel's unsent bytes to the new one,
                // preserving order.
                for chunk in old.send_buf.drain() {
                    chosen.write_chunk(chunk);
                }
                *old.peer.lock() = None;
            }
        }

        if let Some(pending) = self.pending.get(&chosen.addr()) {
            if Arc::ptr_eq(pending, &chosen) {
                self.pending.remove(&chosen.addr());
            }
        }
        let _ = core.user_tx.send(UserEvent::Peer(chosen.clone(), true));
        info!("established peer channel {pid} over {chosen}");
    }

    fn handle_ping(&mut self, core: &mut PoolCore, hs: Handshake, conn: Arc<Conn>) {
        if conn.is_terminated() {
            return;
        }
        let Some(claimed) = hs.claimed_addr else {
            // Heartbeat ping: answer with a heartbeat pong.
            debug!("ping from {conn}");
            self.send_handshake(core, self.cfg.pong_opcode, &Handshake::heartbeat(), &conn);
            return;
        };
        if conn.mode() != ConnMode::Passive {
            warn!("unexpected inbound handshake from {conn}");
            return;
        }
        let pid = self.get_peer_id(&conn, claimed);
        let peers = Arc::clone(&self.peers);
        let mut peers = peers.write();
        let Some(p) = peers.get_mut(&pid) else {
            if self.cfg.allow_unknown_peer {
                let _ = core
                    .user_tx
                    .send(UserEvent::UnknownPeer(claimed, conn.peer_cert()));
            }
            info!("handshake from unknown peer {pid} ({claimed}), terminating");
            core.disp_terminate(&conn);
            return;
        };
        if p.state != PeerState::Disconnected {
            debug!("peer {pid} already completed handshake, dropping ping");
            return;
        }
        if p.addr.is_some_and(|a| a != claimed) {
            debug!("peer {pid} claimed {claimed}, expected {:?}", p.addr);
            return;
        }
        info!("inbound handshake for {pid} from {conn}");
        let local_nonce = if p.addr.is_none() {
            PASSIVE_NONCE
        } else {
            match p.get_nonce() {
                Ok(nonce) => nonce,
                Err(err) => {
                    core.report(err, true);
                    core.disp_terminate(&conn);
                    return;
                }
            }
        };
        let pong = Handshake::hello(self.listen_addr(), local_nonce);
        self.send_handshake(core, self.cfg.pong_opcode, &pong, &conn);

        if let Some(old) = p.inbound_conn.take() {
            if !Arc::ptr_eq(&old, &conn) {
                debug!("terminating stale inbound candidate {old}");
                *old.peer.lock() = None;
                core.disp_terminate(&old);
            }
        }
        p.inbound_conn = Some(conn.clone());
        *conn.peer.lock() = Some(pid);

        if hs.nonce < local_nonce || p.addr.is_none() {
            debug!("{conn} chosen (remote nonce {:04x})", hs.nonce);
            self.finish_handshake(core, p, pid, conn);
        } else {
            debug!(
                "remote nonce {:04x} >= local {:04x}, terminating inbound",
                hs.nonce, local_nonce
            );
            core.disp_terminate(&conn);
        }
    }

    fn handle_pong(&mut self, core: &mut PoolCore, hs: Handshake, conn: Arc<Conn>) {
        if conn.is_terminated() {
            return;
        }
        let Some(claimed) = hs.claimed_addr else {
            // Heartbeat pong: half of the liveness conjunction.
            let Some(pid) = *conn.peer.lock() else {
                warn!("unexpected pong message from {conn}");
                return;
            };
            let peers = Arc::clone(&self.peers);
            let mut peers = peers.write();
            let Some(p) = peers.get_mut(&pid) else {
                return;
            };
            if p.state != PeerState::Connected {
                return;
            }
            p.pong_msg_ok = true;
            if p.ping_timer_ok {
                self.arm_ping_timer(p, pid);
                self.send_ping(core, p);
            }
            return;
        };
        if conn.mode() != ConnMode::Active {
            warn!("unexpected outbound handshake from {conn}");
            return;
        }
        let pid = self.get_peer_id(&conn, conn.addr());
        let peers = Arc::clone(&self.peers);
        let mut peers = peers.write();
        let Some(p) = peers.get_mut(&pid) else {
            warn!("unexpected pong from unknown peer {pid}");
            core.disp_terminate(&conn);
            return;
        };
        if p.state != PeerState::Disconnected || p.addr != Some(claimed) {
            return;
        }
        info!("outbound handshake for {pid} over {conn}");
        if let Some(old) = p.outbound_conn.take() {
            if !Arc::ptr_eq(&old, &conn) {
                debug!("terminating stale outbound candidate {old}");
                *old.peer.lock() = None;
                core.disp_terminate(&old);
            }
        }
        p.outbound_conn = Some(conn.clone());
        *conn.peer.lock() = Some(pid);

        let local_nonce = match p.get_nonce() {
            Ok(nonce) => nonce,
            Err(err) => {
                core.report(err, true);
                core.disp_terminate(&conn);
                return;
            }
        };
        if local_nonce < hs.nonce {
            debug!("{conn} chosen (local nonce {local_nonce:04x})");
            self.finish_handshake(core, p, pid, conn);
        } else {
            debug!(
                "local nonce {local_nonce:04x} >= remote {:04x}, terminating and resetting",
                hs.nonce
            );
            p.nonce = 0;
            core.disp_terminate(&conn);
        }
    }
}

impl Overlay for PeerOverlay {
    type Cmd = PeerCmd;

    fn on_setup(&mut self, core: &mut PoolCore, conn: &Arc<Conn>) {
        self.replace_pending(core, conn);
        if conn.mode() != ConnMode::Active {
            return;
        }
        // Open the handshake from the dialing side.
        let pid = self.get_peer_id(conn, conn.addr());
        let nonce = {
            let peers = Arc::clone(&self.peers);
            let mut peers = peers.write();
            match peers.get_mut(&pid) {
                Some(p) => p.get_nonce(),
                None => {
                    warn!("active connection {conn} has no registered peer");
                    return;
                }
            }
        };
        let nonce = match nonce {
            Ok(nonce) => nonce,
            Err(err) => {
                core.report(err, true);
                core.disp_terminate(conn);
                return;
            }
        };
        let hello = Handshake::hello(self.listen_addr(), nonce);
        self.send_handshake(core, self.cfg.ping_opcode, &hello, conn);
    }

    fn on_teardown(&mut self, core: &mut PoolCore, conn: &Arc<Conn>) {
        if let Some(pending) = self.pending.get(&conn.addr()) {
            if Arc::ptr_eq(pending, conn) {
                self.pending.remove(&conn.addr());
            }
        }
        let Some(pid) = *conn.peer.lock() else {
            return;
        };
        let peers = Arc::clone(&self.peers);
        let mut peers = peers.write();
        let Some(p) = peers.get_mut(&pid) else {
            return;
        };

        let was_reset = p.state == PeerState::Reset;
        let is_chosen = p.conn.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn));
        let mut was_outbound = false;
        if p.outbound_conn.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
            p.outbound_conn = None;
            was_outbound = true;
        }
        if p.inbound_conn.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
            p.inbound_conn = None;
        }

        if is_chosen {
            info!("lost peer channel {pid} ({conn})");
            p.state = PeerState::Disconnected;
            for cand in [p.inbound_conn.take(), p.outbound_conn.take()]
                .into_iter()
                .flatten()
            {
                *cand.peer.lock() = None;
            }
            p.timer_gen += 1;
            p.nonce = 0;
            p.retry_armed = false;
            let _ = core.user_tx.send(UserEvent::Peer(conn.clone(), false));
            self.arm_retry(p, pid, was_reset);
        } else if p.state == PeerState::Disconnected && was_outbound {
            // A dial failed or lost a nonce round before any channel was
            // chosen; keep the pairing alive per the retry policy.
            self.arm_retry(p, pid, false);
        }
    }

    fn on_cmd(&mut self, core: &mut PoolCore, cmd: PeerCmd) {
        match cmd {
            PeerCmd::AddPeer { pid, id } => {
                let mut peers = self.peers.write();
                if peers.contains_key(&pid) {
                    core.recoverable(NetError::PeerAlreadyExists, id);
                    return;
                }
                info!("registered peer {pid}");
                peers.insert(pid, Peer::new());
            }
            PeerCmd::SetPeerAddr { pid, addr, id } => {
                let mut peers = self.peers.write();
                match peers.get_mut(&pid) {
                    Some(p) => p.addr = Some(addr),
                    None => core.recoverable(NetError::PeerNotExist, id),
                }
            }
            PeerCmd::ConnPeer {
                pid,
                ntry,
                retry_delay,
                id,
            } => {
                let peers = Arc::clone(&self.peers);
                let mut peers = peers.write();
                let Some(p) = peers.get_mut(&pid) else {
                    core.recoverable(NetError::PeerNotExist, id);
                    return;
                };
                if p.addr.is_none() {
                    core.recoverable(NetError::PeerNotReady, id);
                    return;
                }
                p.ntry = ntry;
                p.retry_delay = retry_delay;
                for cand in [p.inbound_conn.take(), p.outbound_conn.take()]
                    .into_iter()
                    .flatten()
                {
                    *cand.peer.lock() = None;
                }
                p.timer_gen += 1;
                p.retry_armed = false;
                p.nonce = 0;
                if p.conn.is_none() || p.state == PeerState::Disconnected {
                    self.start_active_conn(core, p, pid);
                } else if p.state == PeerState::Connected {
                    // Terminate the established channel first; the teardown
                    // handler reconnects immediately on seeing Reset.
                    p.state = PeerState::Reset;
                    if let Some(conn) = p.conn.clone() {
                        core.disp_terminate(&conn);
                    }
                }
            }
            PeerCmd::DelPeer { pid, id } => {
                let mut peers = self.peers.write();
                let Some(p) = peers.remove(&pid) else {
                    core.recoverable(NetError::PeerNotExist, id);
                    return;
                };
                drop(peers);
                info!("removing peer {pid}");
                for cand in [p.inbound_conn, p.outbound_conn].into_iter().flatten() {
                    *cand.peer.lock() = None;
                }
                if let Some(conn) = &p.conn {
                    *conn.peer.lock() = None;
                    core.disp_terminate(conn);
                }
                if let Some(addr) = p.addr {
                    if let Some(pending) = self.pending.remove(&addr) {
                        if pending.peer.lock().is_none() {
                            core.disp_terminate(&pending);
                        }
                    }
                }
            }
            PeerCmd::SetListenAddr { addr } => self.listen_addr = Some(addr),
            PeerCmd::Ping { hs, conn } => self.handle_ping(core, hs, conn),
            PeerCmd::Pong { hs, conn } => self.handle_pong(core, hs, conn),
            PeerCmd::PingTimer { pid, gen } => {
                let peers = Arc::clone(&self.peers);
                let mut peers = peers.write();
                let Some(p) = peers.get_mut(&pid) else {
                    return;
                };
                if p.timer_gen != gen || p.state != PeerState::Connected {
                    return;
                }
                p.ping_timer_ok = true;
                if p.pong_msg_ok {
                    self.arm_ping_timer(p, pid);
                    self.send_ping(core, p);
                }
            }
            PeerCmd::RetryTimer { pid, gen } => {
                let peers = Arc::clone(&self.peers);
                let mut peers = peers.write();
                let Some(p) = peers.get_mut(&pid) else {
                    return;
                };
                if p.timer_gen != gen {
                    return;
                }
                p.retry_armed = false;
                if p.state != PeerState::Disconnected {
                    return;
                }
                self.start_active_conn(core, p, pid);
            }
            PeerCmd::GetNPending { reply } => {
                let _ = reply.send(self.pending.len());
            }
            PeerCmd::SendDeferred { pid, msg, id } => {
                let peers = self.peers.read();
                let conn = match peers.get(&pid) {
                    Some(p) => p.conn.clone(),
                    None => {
                        core.recoverable(NetError::PeerNotExist, id);
                        return;
                    }
                };
                drop(peers);
                let len = msg.len();
                let sent = conn
                    .map(|conn| {
                        let ok = conn.write_chunk(msg.encode(core.msg_magic()));
                        if ok {
                            conn.stats().record_sent(len);
                        }
                        ok
                    })
                    .unwrap_or(false);
                if !sent {
                    core.recoverable(NetError::ConnNotReady, id);
                }
            }
            PeerCmd::Multicast { pids, msg, id } => {
                // Serialize once; every target gets the same frame bytes.
                let len = msg.len();
                let frame = msg.encode(core.msg_magic());
                let peers = self.peers.read();
                let mut all_sent = true;
                for pid in &pids {
                    let Some(p) = peers.get(pid) else {
                        core.recoverable(NetError::PeerNotExist, id);
                        return;
                    };
                    match &p.conn {
                        Some(conn) if conn.write_chunk(frame.clone()) => {
                            conn.stats().record_sent(len);
                        }
                        _ => all_sent = false,
                    }
                }
                if !all_sent {
                    core.recoverable(NetError::ConnNotReady, id);
                }
            }
            #[cfg(feature = "dev-context-only-utils")]
            PeerCmd::PinNonce { pid, nonce } => {
                if let Some(p) = self.peers.write().get_mut(&pid) {
                    p.pinned_nonce = nonce;
                    if nonce.is_none() {
                        p.nonce = 0;
                    }
                }
            }
        }
    }
}

// ── Public peer network ─────────────────────────────────────────────────────

/// Peer-to-peer network where any two registered nodes hold at most one
/// bi-directional message channel, established by either side.
///
/// Peers are registered by [`PeerId`]; `conn_peer` starts dialing with a
/// retry policy, and the handshake converges both sides onto a single
/// surviving connection. Application opcodes are dispatched exactly as on a
/// [`MsgNetwork`](crate::MsgNetwork).
pub struct PeerNetwork {
    base: NetBase,
    ext_tx: mpsc::UnboundedSender<PeerCmd>,
    peers: PeerMap,
    msg_magic: u32,
}

impl PeerNetwork {
    /// Create a peer network with the given configuration.
    pub fn new(cfg: PeerNetConfig) -> Self {
        let peers: PeerMap = Arc::new(RwLock::new(HashMap::new()));
        let msg_magic = cfg.net.msg_magic;
        let overlay_cfg = cfg.clone();
        let overlay_peers = Arc::clone(&peers);
        let (base, ext_tx) = spawn_net(
            cfg.net.clone(),
            Some(cfg.conn_timeout),
            move |ext_tx: mpsc::UnboundedSender<PeerCmd>, _user_tx, cbs: Arc<Callbacks>| {
                // Handshake frames ride the normal inbound queue; these
                // handlers bounce them back onto the dispatcher.
                let ping_tx = ext_tx.clone();
                cbs.set_handler(
                    overlay_cfg.ping_opcode,
                    Arc::new(move |msg: Msg, conn: &Arc<Conn>| match Handshake::decode(
                        msg.payload(),
                    ) {
                        Some(hs) => {
                            let _ = ping_tx.send(PeerCmd::Ping {
                                hs,
                                conn: conn.clone(),
                            });
                        }
                        None => warn!("malformed ping payload from {conn}"),
                    }),
                );
                let pong_tx = ext_tx.clone();
                cbs.set_handler(
                    overlay_cfg.pong_opcode,
                    Arc::new(move |msg: Msg, conn: &Arc<Conn>| match Handshake::decode(
                        msg.payload(),
                    ) {
                        Some(hs) => {
                            let _ = pong_tx.send(PeerCmd::Pong {
                                hs,
                                conn: conn.clone(),
                            });
                        }
                        None => warn!("malformed pong payload from {conn}"),
                    }),
                );
                PeerOverlay {
                    cfg: overlay_cfg,
                    peers: overlay_peers,
                    pending: HashMap::new(),
                    listen_addr: None,
                    ext_tx,
                }
            },
        );
        Self {
            base,
            ext_tx,
            peers,
            msg_magic,
        }
    }

    /// Bind the passive listener and record the advertised listen address
    /// used in handshakes. Returns the bound address.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let local = self.base.listen(addr).await?;
        let _ = self.ext_tx.send(PeerCmd::SetListenAddr { addr: local });
        Ok(local)
    }

    /// Register a peer as known. Returns the operation's async id;
    /// registering a duplicate surfaces `PeerAlreadyExists` on the
    /// recoverable-error callback.
    pub fn add_peer(&self, pid: PeerId) -> i32 {
        let id = self.base.gen_async_id();
        let _ = self.ext_tx.send(PeerCmd::AddPeer { pid, id });
        id
    }

    /// Set the peer's dial address.
    pub fn set_peer_addr(&self, pid: PeerId, addr: SocketAddr) -> i32 {
        let id = self.base.gen_async_id();
        let _ = self.ext_tx.send(PeerCmd::SetPeerAddr { pid, addr, id });
        id
    }

    /// Mark the peer eligible for active dialing and start a handshake if
    /// none is in progress. `ntry` counts total attempts: -1 retries
    /// indefinitely, 0 gives up, 1 dials once.
    pub fn conn_peer(&self, pid: PeerId, ntry: i32, retry_delay: Duration) -> i32 {
        let id = self.base.gen_async_id();
        let _ = self.ext_tx.send(PeerCmd::ConnPeer {
            pid,
            ntry,
            retry_delay,
            id,
        });
        id
    }

    /// Unregister a peer, terminating its channel and evicting any pending
    /// handshake connection at its address.
    pub fn del_peer(&self, pid: PeerId) -> i32 {
        let id = self.base.gen_async_id();
        let _ = self.ext_tx.send(PeerCmd::DelPeer { pid, id });
        id
    }

    /// Whether the peer is registered.
    pub fn has_peer(&self, pid: &PeerId) -> bool {
        self.peers.read().contains_key(pid)
    }

    /// The peer's current channel, if the handshake has completed.
    /// Errors with `PeerNotExist` for unregistered ids.
    pub fn get_peer_conn(&self, pid: &PeerId) -> Result<Option<Arc<Conn>>> {
        match self.peers.read().get(pid) {
            Some(p) => Ok(p.conn.clone()),
            None => Err(NetError::PeerNotExist),
        }
    }

    /// Number of connections still waiting for their handshake.
    pub async fn get_npending(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.ext_tx.send(PeerCmd::GetNPending { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Queue a message for a peer on the user thread. Returns false when the
    /// peer has no established channel or its send queue is full.
    pub fn send_msg(&self, msg: &Msg, pid: &PeerId) -> bool {
        let conn = match self.peers.read().get(pid) {
            Some(p) => p.conn.clone(),
            None => None,
        };
        let Some(conn) = conn else {
            return false;
        };
        let len = msg.len();
        let ok = conn.write_chunk(msg.encode(self.msg_magic));
        if ok {
            conn.stats().record_sent(len);
        }
        ok
    }

    /// Send via the dispatcher; failures (unknown peer, no channel) surface
    /// on the recoverable-error callback tagged with the returned async id.
    pub fn send_msg_deferred(&self, msg: Msg, pid: PeerId) -> i32 {
        let id = self.base.gen_async_id();
        let _ = self.ext_tx.send(PeerCmd::SendDeferred { pid, msg, id });
        id
    }

    /// Serialize once and send to every listed peer. A missing peer or a
    /// failed write yields a single recoverable error for the batch.
    pub fn multicast_msg(&self, msg: Msg, pids: &[PeerId]) -> i32 {
        let id = self.base.gen_async_id();
        let _ = self.ext_tx.send(PeerCmd::Multicast {
            pids: pids.to_vec(),
            msg,
            id,
        });
        id
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

    /// Register the peer up/down callback: invoked with the chosen channel
    /// when a handshake completes and when that channel is lost.
    pub fn reg_peer_handler(&self, cb: impl Fn(&Arc<Conn>, bool) + Send + Sync + 'static) {
        self.base.cbs.set_peer_cb(Arc::new(cb));
    }

    /// Register the callback invoked when `allow_unknown_peer` is set and an
    /// unregistered peer completes an inbound handshake ping.
    pub fn reg_unknown_peer_handler(
        &self,
        cb: impl Fn(SocketAddr, Option<Bytes>) + Send + Sync + 'static,
    ) {
        self.base.cbs.set_unknown_peer_cb(Arc::new(cb));
    }

    /// Register the error callback.
    pub fn reg_error_handler(
        &self,
        cb: impl Fn(&NetError, bool, Option<i32>) + Send + Sync + 'static,
    ) {
        self.base.reg_error_handler(cb);
    }

    /// Test hook: pin (or with `None`, unpin and reset) the peer's handshake
    /// nonce so tiebreak outcomes can be forced deterministically.
    #[cfg(feature = "dev-context-only-utils")]
    pub fn pin_peer_nonce(&self, pid: PeerId, nonce: Option<u32>) {
        let _ = self.ext_tx.send(PeerCmd::PinNonce { pid, nonce });
    }

    /// Tear a connection down. Idempotent.
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
    use super::*;

    #[test]
    fn test_handshake_hello_roundtrip() {
        let addr: SocketAddr = "10.1.2.3:8900".parse().unwrap();
        let hs = Handshake::hello(addr, 0x1234);
        let decoded = Handshake::decode(&hs.encode()).unwrap();
        assert_eq!(decoded, hs);
        assert_eq!(decoded.claimed_addr, Some(addr));
        assert_eq!(decoded.nonce, 0x1234);
    }

    #[test]
    fn test_handshake_heartbeat_roundtrip() {
        let hs = Handshake::heartbeat();
        let wire = hs.encode();
        assert_eq!(wire.len(), 1);
        assert_eq!(Handshake::decode(&wire).unwrap(), hs);
    }

    #[test]
    fn test_handshake_ipv6_roundtrip() {
        let addr: SocketAddr = "[2001:db8::1]:9000".parse().unwrap();
        let hs = Handshake::hello(addr, 0xfffe);
        assert_eq!(Handshake::decode(&hs.encode()).unwrap(), hs);
    }

    #[test]
    fn test_handshake_decode_rejects_truncated() {
        let addr: SocketAddr = "10.1.2.3:8900".parse().unwrap();
        let wire = Handshake::hello(addr, 7).encode();
        for cut in 1..wire.len() {
            assert!(Handshake::decode(&wire[..cut]).is_none(), "cut {cut}");
        }
        assert!(Handshake::decode(&[]).is_none());
    }

    #[test]
    fn test_peer_id_is_deterministic_and_distinct() {
        let a: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        assert_eq!(PeerId::from_addr(&a), PeerId::from_addr(&a));
        assert_ne!(PeerId::from_addr(&a), PeerId::from_addr(&b));
        assert_ne!(PeerId::from_addr(&a), PeerId::from_cert_der(b"cert"));
    }

    #[test]
    fn test_nonce_draw_reserves_sentinel() {
        let mut p = Peer::new();
        for _ in 0..1000 {
            p.nonce = 0;
            let n = p.get_nonce().unwrap();
            assert!((1..=0xfffe).contains(&n), "nonce {n:#x} out of range");
            assert_ne!(n, PASSIVE_NONCE);
            // Stable until reset.
            assert_eq!(p.get_nonce().unwrap(), n);
        }
    }

    #[test]
    fn test_draw_nonce_covers_full_band() {
        for _ in 0..1000 {
            let n = draw_nonce().unwrap();
            assert!((1..=0xfffe).contains(&n), "nonce {n:#x} out of range");
        }
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let d = rand_jitter(base);
            assert!(d >= base / 2);
            assert!(d < base * 3 / 2);
        }
    }
}
