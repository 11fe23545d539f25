//! Message-flow scenarios: FIFO delivery, multicast, deferred-send errors,
//! inbound-queue backpressure, and cross-instance magic rejection.

use {
    crate::harness::{
        fast_cfg, init_logger, node_pair, wait_established, wait_until, TestNode, TestPayload,
        OP_DATA,
    },
    meshwire::{MsgNetConfig, MsgNetwork, PeerId},
    std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc as std_mpsc, Arc, Mutex as StdMutex,
        },
        time::Duration,
    },
    tokio::{sync::mpsc, time::sleep},
};

const RETRY: Duration = Duration::from_millis(100);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fifo_delivery_over_peer_channel() {
    init_logger();
    let (a, mut b) = node_pair(fast_cfg()).await;
    a.net.conn_peer(b.id, -1, RETRY);
    wait_established(&a, &b).await;

    for seq in 0..200u64 {
        assert!(a
            .net
            .send_msg(&TestPayload::new(seq, "ordered").to_msg(), &b.id));
    }
    for seq in 0..200u64 {
        let payload = tokio::time::timeout(Duration::from_secs(10), b.payloads.recv())
            .await
            .expect("payload")
            .unwrap();
        assert_eq!(payload.seq, seq, "messages arrived out of order");
        assert_eq!(payload.body, "ordered");
    }

    // The traffic shows up in the channel's counters.
    let conn = a.net.get_peer_conn(&b.id).unwrap().unwrap();
    assert!(conn.stats().nsent() >= 200);
    assert!(conn.stats().nsentb() > 0);

    a.net.stop().await;
    b.net.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multicast_reaches_all_peers() {
    init_logger();
    let hub = TestNode::start(fast_cfg()).await;
    let mut b = TestNode::start(fast_cfg()).await;
    let mut c = TestNode::start(fast_cfg()).await;
    hub.register(&b);
    hub.register(&c);
    b.register(&hub);
    c.register(&hub);

    hub.net.conn_peer(b.id, -1, RETRY);
    hub.net.conn_peer(c.id, -1, RETRY);
    wait_established(&hub, &b).await;
    wait_established(&hub, &c).await;

    hub.net
        .multicast_msg(TestPayload::new(7, "fanout").to_msg(), &[b.id, c.id]);

    for node in [&mut b, &mut c] {
        let payload = tokio::time::timeout(Duration::from_secs(10), node.payloads.recv())
            .await
            .expect("payload")
            .unwrap();
        assert_eq!(payload, TestPayload::new(7, "fanout"));
    }

    hub.net.stop().await;
    b.net.stop().await;
    c.net.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multicast_with_missing_peer_reports_once() {
    init_logger();
    let (mut a, b) = node_pair(fast_cfg()).await;
    a.net.conn_peer(b.id, -1, RETRY);
    wait_established(&a, &b).await;

    let ghost = PeerId::from_cert_der(b"ghost");
    let id = a
        .net
        .multicast_msg(TestPayload::new(1, "partial").to_msg(), &[ghost, b.id]);

    let (text, fatal, got_id) = tokio::time::timeout(Duration::from_secs(10), a.errors.recv())
        .await
        .expect("batch error")
        .unwrap();
    assert!(text.contains("peer does not exist"));
    assert!(!fatal);
    assert_eq!(got_id, Some(id));
    // One error for the whole batch.
    sleep(Duration::from_millis(300)).await;
    assert!(a.errors.try_recv().is_err());

    a.net.stop().await;
    b.net.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_send_before_handshake_fails() {
    init_logger();
    let (mut a, b) = node_pair(fast_cfg()).await;

    // Registered but never connected: the sync path refuses, the deferred
    // path reports with its async id.
    assert!(!a.net.send_msg(&TestPayload::new(0, "early").to_msg(), &b.id));

    let id = a
        .net
        .send_msg_deferred(TestPayload::new(0, "early").to_msg(), b.id);
    let (text, fatal, got_id) = tokio::time::timeout(Duration::from_secs(10), a.errors.recv())
        .await
        .expect("deferred error")
        .unwrap();
    assert!(text.contains("connection not ready"));
    assert!(!fatal);
    assert_eq!(got_id, Some(id));

    a.net.stop().await;
    b.net.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_inbound_backpressure_pauses_and_resumes() {
    init_logger();
    // A tiny inbound queue on the server plus a gated handler: the reader
    // must pause once the queue fills, and resume as the user drains it.
    let server = MsgNetwork::new(MsgNetConfig {
        max_msg_queue_size: 4,
        burst_size: 2,
        ..MsgNetConfig::dev_default()
    });
    let client = MsgNetwork::new(MsgNetConfig::dev_default());

    let (token_tx, token_rx) = std_mpsc::channel::<()>();
    let token_rx = StdMutex::new(token_rx);
    let processed = Arc::new(AtomicUsize::new(0));
    {
        let processed = Arc::clone(&processed);
        server.reg_handler(OP_DATA, move |_msg, _conn| {
            token_rx.lock().unwrap().recv().unwrap();
            processed.fetch_add(1, Ordering::SeqCst);
        });
    }

    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
    server.reg_conn_handler(move |conn, up| {
        if up {
            let _ = conn_tx.send(conn.clone());
        }
    });

    let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let conn = client.connect(addr).await.unwrap();

    const TOTAL: usize = 30;
    for seq in 0..TOTAL as u64 {
        assert!(client.send_msg(&TestPayload::new(seq, "pressure").to_msg(), &conn));
    }

    let server_conn = tokio::time::timeout(Duration::from_secs(10), conn_rx.recv())
        .await
        .expect("server conn")
        .unwrap();
    wait_until("reader paused on full queue", || async {
        server_conn.recv_paused()
    })
    .await;

    for _ in 0..TOTAL {
        token_tx.send(()).unwrap();
    }
    wait_until("all messages processed", || async {
        processed.load(Ordering::SeqCst) == TOTAL
    })
    .await;
    wait_until("reader resumed", || async { !server_conn.recv_paused() }).await;

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mismatched_magic_is_dropped_silently() {
    init_logger();
    let server = MsgNetwork::new(MsgNetConfig {
        msg_magic: 0x1111_1111,
        ..MsgNetConfig::dev_default()
    });
    let client = MsgNetwork::new(MsgNetConfig {
        msg_magic: 0x2222_2222,
        ..MsgNetConfig::dev_default()
    });

    let (got_tx, mut got_rx) = mpsc::unbounded_channel();
    server.reg_handler(OP_DATA, move |msg, _conn| {
        let _ = got_tx.send(msg.payload().clone());
    });

    let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let conn = client.connect(addr).await.unwrap();
    for seq in 0..3u64 {
        assert!(client.send_msg(&TestPayload::new(seq, "alien").to_msg(), &conn));
    }

    // Frames from the foreign deployment are dropped without killing the
    // connection.
    sleep(Duration::from_millis(600)).await;
    assert!(got_rx.try_recv().is_err());
    assert!(!conn.is_terminated());

    client.stop().await;
    server.stop().await;
}
