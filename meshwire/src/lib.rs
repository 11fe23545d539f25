//! meshwire — asynchronous message-oriented networking.
//!
//! Three stacked abstractions:
//!
//! - **Connection pool** — dials and accepts TCP connections, assigns each
//!   to the least-loaded worker shard, and drives its I/O with dedicated
//!   reader/writer tasks.
//! - **Message network** — frames byte streams into opcode-dispatched
//!   messages with a fixed header (magic, opcode, length, checksum), a
//!   bounded inbound queue, and burst-drained user callbacks.
//! - **Peer network** — an overlay that converges every configured peer pair
//!   onto exactly one authenticated bi-directional channel, with a
//!   nonce-tiebreak handshake, heartbeat liveness, and automatic reconnect.
//!
//! A stripped [`ClientNetwork`] serves request/response clients indexed by
//! remote address.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────────────────────────────────────────────┐
//!  │  user code                                           │
//!  │  ← message / conn / peer / error callbacks           │
//!  │  → connect, listen, send_msg, conn_peer, terminate   │
//!  └───────────────┬──────────────────────────────────────┘
//!                  │ command channels        ▲ delivery task
//!  ┌───────────────▼──────────────┐  ┌───────┴───────────┐
//!  │  dispatcher task             │  │ bounded inbound   │
//!  │  • pool map, listener        │  │ queue (burst      │
//!  │  • peer registry, handshake  │  │ drain + yield)    │
//!  └───────────────┬──────────────┘  └───────▲───────────┘
//!                  │ feeds conns             │ frames
//!  ┌───────────────▼──────────────────────────┴──────────┐
//!  │  worker shards: per-connection reader/writer tasks  │
//!  │  (frame parser, send buffer, liveness deadline)     │
//!  └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`]     | `MsgNetConfig` / `PeerNetConfig` defaults and dev overrides |
//! | [`msg`]        | Frame header codec, checksum, incremental parser |
//! | [`conn`]       | Connection object, send buffer, reader/writer tasks |
//! | [`pool`]       | Dispatcher engine, worker shards, accept/connect paths |
//! | [`msg_net`]    | Opcode handler registry, inbound queue, delivery task |
//! | [`peer_net`]   | Peer registry, handshake state machine, liveness |
//! | [`client_net`] | Passive-only address-indexed variant |
//! | [`error`]      | Crate-wide error enum |

pub mod client_net;
pub mod config;
pub mod conn;
pub mod error;
pub mod msg;
pub mod msg_net;
pub mod peer_net;
pub mod pool;

pub use {
    client_net::ClientNetwork,
    config::{IdentityMode, MsgNetConfig, PeerNetConfig},
    conn::{Conn, ConnMode, ConnStats},
    error::{NetError, Result},
    msg::Msg,
    msg_net::MsgNetwork,
    peer_net::{PeerId, PeerNetwork},
};
