//! Client-facing network: passive connections indexed by remote address.
//!
//! A stripped variant of the message network for serving request/response
//! clients: no handshake, no liveness pings, no peer registry. Accepted
//! connections are indexed by their remote address; replies are addressed by
//! that address and fail with `ClientNotExist` once the client is gone.

use {
    crate::{
        config::MsgNetConfig,
        conn::{Conn, ConnMode},
        error::{NetError, Result},
        msg::Msg,
        msg_net::{spawn_net, NetBase},
        pool::{Overlay, PoolCore},
    },
    log::debug,
    parking_lot::RwLock,
    std::{collections::HashMap, net::SocketAddr, sync::Arc},
    tokio::sync::mpsc,
};

type AddrMap = Arc<RwLock<HashMap<SocketAddr, Arc<Conn>>>>;

pub(crate) enum ClientCmd {
    SendDeferred {
        addr: SocketAddr,
        msg: Msg,
        id: i32,
    },
}

struct ClientOverlay {
    addr2conn: AddrMap,
}

impl Overlay for ClientOverlay {
    type Cmd = ClientCmd;

    fn on_setup(&mut self, _core: &mut PoolCore, conn: &Arc<Conn>) {
        if conn.mode() != ConnMode::Passive {
            return;
        }
        debug!("client up: {conn}");
        self.addr2conn.write().insert(conn.addr(), conn.clone());
    }

    fn on_teardown(&mut self, _core: &mut PoolCore, conn: &Arc<Conn>) {
        let mut map = self.addr2conn.write();
        if map.get(&conn.addr()).is_some_and(|c| Arc::ptr_eq(c, conn)) {
            debug!("client gone: {conn}");
            map.remove(&conn.addr());
        }
    }

    fn on_cmd(&mut self, core: &mut PoolCore, cmd: ClientCmd) {
        match cmd {
            ClientCmd::SendDeferred { addr, msg, id } => {
                let conn = self.addr2conn.read().get(&addr).cloned();
                let Some(conn) = conn else {
                    core.recoverable(NetError::ClientNotExist, id);
                    return;
                };
                let len = msg.len();
                if conn.write_chunk(msg.encode(core.msg_magic())) {
                    conn.stats().record_sent(len);
                } else {
                    core.recoverable(NetError::ConnNotReady, id);
                }
            }
        }
    }
}

/// Server-side network for request/response clients, indexed by the
/// client's remote address.
pub struct ClientNetwork {
    base: NetBase,
    ext_tx: mpsc::UnboundedSender<ClientCmd>,
    addr2conn: AddrMap,
    msg_magic: u32,
}

impl ClientNetwork {
    /// Create a client network with the given configuration.
    pub fn new(cfg: MsgNetConfig) -> Self {
        let addr2conn: AddrMap = Arc::new(RwLock::new(HashMap::new()));
        let msg_magic = cfg.msg_magic;
        let overlay_map = Arc::clone(&addr2conn);
        let (base, ext_tx) = spawn_net(cfg, None, move |_ext_tx, _user_tx, _cbs| ClientOverlay {
            addr2conn: overlay_map,
        });
        Self {
            base,
            ext_tx,
            addr2conn,
            msg_magic,
        }
    }

    /// Bind the listener clients connect to; returns the bound address.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        self.base.listen(addr).await
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

    /// Register the error callback.
    pub fn reg_error_handler(
        &self,
        cb: impl Fn(&NetError, bool, Option<i32>) + Send + Sync + 'static,
    ) {
        self.base.reg_error_handler(cb);
    }

    /// Queue a message for the client at `addr`. Errors with
    /// `ClientNotExist` when no such client is connected; returns false when
    /// the client's send queue is full.
    pub fn send_msg(&self, msg: &Msg, addr: &SocketAddr) -> Result<bool> {
        let conn = self
            .addr2conn
            .read()
            .get(addr)
            .cloned()
            .ok_or(NetError::ClientNotExist)?;
        let len = msg.len();
        let ok = conn.write_chunk(msg.encode(self.msg_magic));
        if ok {
            conn.stats().record_sent(len);
        }
        Ok(ok)
    }

    /// Send via the dispatcher; a missing client surfaces on the
    /// recoverable-error callback tagged with the returned async id.
    pub fn send_msg_deferred(&self, msg: Msg, addr: SocketAddr) -> i32 {
        let id = self.base.gen_async_id();
        let _ = self.ext_tx.send(ClientCmd::SendDeferred { addr, msg, id });
        id
    }

    /// Tear a client connection down. Idempotent.
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
        crate::msg_net::MsgNetwork,
        std::time::Duration,
        tokio::{sync::mpsc::unbounded_channel, time::timeout},
    };

    const OP_REQ: u8 = 0x20;
    const OP_RESP: u8 = 0x21;

    #[tokio::test]
    async fn test_request_response_by_address() {
        let server = ClientNetwork::new(MsgNetConfig::dev_default());
        let client = MsgNetwork::new(MsgNetConfig::dev_default());

        // The server answers every request by client address.
        let (req_tx, mut req_rx) = unbounded_channel();
        server.reg_handler(OP_REQ, move |msg, conn| {
            let _ = req_tx.send((msg.payload().clone(), conn.addr()));
        });

        let (resp_tx, mut resp_rx) = unbounded_channel();
        client.reg_handler(OP_RESP, move |msg, _conn| {
            let _ = resp_tx.send(msg.payload().clone());
        });

        let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let conn = client.connect(addr).await.unwrap();
        assert!(client.send_msg(&Msg::new(OP_REQ, &b"ping me"[..]), &conn));

        let (payload, client_addr) = timeout(Duration::from_secs(5), req_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&payload[..], b"ping me");

        assert!(server
            .send_msg(&Msg::new(OP_RESP, &b"pong"[..]), &client_addr)
            .unwrap());
        let payload = timeout(Duration::from_secs(5), resp_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&payload[..], b"pong");

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_client_fails() {
        let server = ClientNetwork::new(MsgNetConfig::dev_default());
        let addr: SocketAddr = "127.0.0.1:39999".parse().unwrap();
        let err = server.send_msg(&Msg::new(OP_RESP, &b"x"[..]), &addr).unwrap_err();
        assert!(matches!(err, NetError::ClientNotExist));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_deferred_send_to_unknown_client_reports_id() {
        let server = ClientNetwork::new(MsgNetConfig::dev_default());
        let (err_tx, mut err_rx) = unbounded_channel();
        server.reg_error_handler(move |err, fatal, id| {
            let _ = err_tx.send((format!("{err}"), fatal, id));
        });
        let addr: SocketAddr = "127.0.0.1:39998".parse().unwrap();
        let id = server.send_msg_deferred(Msg::new(OP_RESP, &b"x"[..]), addr);
        let (text, fatal, got) = timeout(Duration::from_secs(5), err_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(text.contains("client does not exist"));
        assert!(!fatal);
        assert_eq!(got, Some(id));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_client_index_tracks_teardown() {
        let server = ClientNetwork::new(MsgNetConfig::dev_default());
        let client = MsgNetwork::new(MsgNetConfig::dev_default());

        let (ev_tx, mut ev_rx) = unbounded_channel();
        server.reg_conn_handler(move |conn, up| {
            let _ = ev_tx.send((conn.addr(), up));
        });

        let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let conn = client.connect(addr).await.unwrap();

        let (client_addr, up) = timeout(Duration::from_secs(5), ev_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(up);
        assert!(server.send_msg(&Msg::new(OP_RESP, &b"hi"[..]), &client_addr).is_ok());

        client.terminate(&conn);
        let (_, up) = timeout(Duration::from_secs(5), ev_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!up);
        assert!(server
            .send_msg(&Msg::new(OP_RESP, &b"hi"[..]), &client_addr)
            .is_err());

        client.stop().await;
        server.stop().await;
    }
}
