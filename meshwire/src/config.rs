//! Configuration for the message network and peer overlay.

use std::time::Duration;

/// Configuration for the framed message network (and the connection pool
/// underneath it).
///
/// Controls listener behavior, worker sharding, buffer sizes, and framing
/// limits for every connection the network drives.
#[derive(Debug, Clone)]
pub struct MsgNetConfig {
    /// `listen(2)` backlog for the passive listener.
    pub max_listen_backlog: u32,

    /// Deadline for an active dial to complete TCP setup.
    pub conn_server_timeout: Duration,

    /// Chunk size used when reading from a socket into the recv buffer.
    pub seg_buff_size: usize,

    /// Number of worker shards (>= 1). New connections are assigned to the
    /// shard with the fewest live connections.
    pub nworker: usize,

    /// Per-connection send queue capacity in chunks. `0` means unbounded and
    /// `write` never fails; with a positive cap, a push into a full queue
    /// fails synchronously.
    pub queue_capacity: usize,

    /// Fatal cap on the declared payload length of inbound frames.
    pub max_msg_size: usize,

    /// Capacity of the bounded inbound message queue shared by all
    /// connections.
    pub max_msg_queue_size: usize,

    /// Maximum messages drained per delivery wakeup before yielding back to
    /// the runtime.
    pub burst_size: usize,

    /// Magic value stamped on every outbound frame and required on every
    /// inbound frame. Frames with a different magic are dropped.
    pub msg_magic: u32,
}

impl Default for MsgNetConfig {
    fn default() -> Self {
        Self {
            max_listen_backlog: 10,
            conn_server_timeout: Duration::from_secs(2),
            seg_buff_size: 4096,
            nworker: 1,
            queue_capacity: 0,
            max_msg_size: 1024,
            max_msg_queue_size: 65536,
            burst_size: 1000,
            msg_magic: 0,
        }
    }
}

impl MsgNetConfig {
    /// Create a config suitable for local testing: short timeouts, small
    /// queues, and a nonzero magic so crossed test instances don't talk.
    pub fn dev_default() -> Self {
        Self {
            conn_server_timeout: Duration::from_millis(500),
            max_msg_size: 65536,
            max_msg_queue_size: 256,
            burst_size: 16,
            msg_magic: 0x6d_65_73_68,
            ..Self::default()
        }
    }
}

/// How a peer's 256-bit identity fingerprint is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityMode {
    /// Hash of the peer's advertised network address.
    AddrBased,
    /// Hash of the peer's DER-encoded transport certificate. Falls back to
    /// the address when the transport carries no certificate.
    CertBased,
}

/// Configuration for the peer-to-peer overlay network.
#[derive(Debug, Clone)]
pub struct PeerNetConfig {
    /// Settings for the underlying message network.
    pub net: MsgNetConfig,

    /// Interval between heartbeat pings on an established peer channel.
    /// The actual timer is jittered around this value.
    pub ping_period: Duration,

    /// Liveness deadline: a connection that stays silent this long is
    /// terminated. Every received byte resets it.
    pub conn_timeout: Duration,

    /// How peer ids are derived.
    pub id_mode: IdentityMode,

    /// Whether an inbound handshake from an unregistered peer invokes the
    /// unknown-peer callback (the connection is terminated either way).
    pub allow_unknown_peer: bool,

    /// Opcode used for handshake/heartbeat pings.
    pub ping_opcode: u8,

    /// Opcode used for handshake/heartbeat pongs.
    pub pong_opcode: u8,
}

impl Default for PeerNetConfig {
    fn default() -> Self {
        Self {
            net: MsgNetConfig::default(),
            ping_period: Duration::from_secs(30),
            conn_timeout: Duration::from_secs(180),
            id_mode: IdentityMode::CertBased,
            allow_unknown_peer: false,
            ping_opcode: 0xf0,
            pong_opcode: 0xf1,
        }
    }
}

impl PeerNetConfig {
    /// Create a config suitable for local testing with fast heartbeats and
    /// short liveness deadlines.
    pub fn dev_default() -> Self {
        Self {
            net: MsgNetConfig::dev_default(),
            ping_period: Duration::from_millis(200),
            conn_timeout: Duration::from_secs(3),
            ..Self::default()
        }
    }
}
