use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use trafcacc_core::accelerate::{run_backend, run_frontend};
use trafcacc_core::transport::Proto;
use trafcacc_core::{
    BackendConfig, Conn, ConnError, Dialer, EngineConfig, Endpoint, FrontendConfig, Listener,
};

fn fast_engine() -> EngineConfig {
    EngineConfig {
        keepalive_interval: Duration::from_millis(50),
        redial_delay: Duration::from_millis(50),
        ..EngineConfig::default()
    }
}

fn endpoint(proto: Proto, addr: SocketAddr) -> Endpoint {
    Endpoint {
        proto,
        host: addr.ip().to_string(),
        port_begin: addr.port(),
        port_end: addr.port(),
    }
}

fn loopback(proto: Proto) -> Endpoint {
    endpoint(proto, "127.0.0.1:0".parse().unwrap())
}

/// A loopback port nobody is listening on right now
async fn free_port() -> u16 {
    let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
    l.local_addr().unwrap().port()
}

async fn read_exactly(conn: &Conn, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut buf = vec![0u8; 8192];
    while out.len() < len {
        let n = tokio::time::timeout(Duration::from_secs(5), conn.read(&mut buf))
            .await
            .expect("read timed out")
            .unwrap();
        assert_ne!(n, 0, "unexpected end of stream");
        out.extend_from_slice(&buf[..n]);
    }
    out
}

async fn pair(listener: &Listener, dialer: &Dialer) -> (Conn, Conn) {
    let front = dialer
        .dial_timeout(Duration::from_secs(5))
        .await
        .expect("dial failed");
    let back = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("accept timed out")
        .expect("listener closed");
    (front, back)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_trip_over_tcp_and_udp_links() {
    let listener = Listener::bind(&[loopback(Proto::Tcp), loopback(Proto::Udp)], fast_engine())
        .await
        .unwrap();
    let links: Vec<Endpoint> = listener
        .local_addrs()
        .iter()
        .map(|(proto, addr)| endpoint(*proto, *addr))
        .collect();

    let dialer = Dialer::new(fast_engine());
    assert_eq!(dialer.setup(&links), 2);

    let (front, back) = pair(&listener, &dialer).await;
    assert_eq!(front.key(), back.key());

    // Large enough to be striped over both links in many packets.
    let request: Vec<u8> = (0..60_000u32).map(|i| (i % 251) as u8).collect();
    front.write(&request).await.unwrap();
    assert_eq!(read_exactly(&back, request.len()).await, request);

    back.write(b"response").await.unwrap();
    assert_eq!(read_exactly(&front, 8).await, b"response");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_connections_share_links() {
    let listener = Listener::bind(&[loopback(Proto::Tcp), loopback(Proto::Tcp)], fast_engine())
        .await
        .unwrap();
    let links: Vec<Endpoint> = listener
        .local_addrs()
        .iter()
        .map(|(proto, addr)| endpoint(*proto, *addr))
        .collect();
    let dialer = Dialer::new(fast_engine());
    dialer.setup(&links);

    let mut pairs = Vec::new();
    for _ in 0..5 {
        pairs.push(pair(&listener, &dialer).await);
    }
    for (i, (front, _)) in pairs.iter().enumerate() {
        front.write(format!("conn-{i}").as_bytes()).await.unwrap();
    }
    for (i, (front, back)) in pairs.iter().enumerate() {
        assert_eq!(back.key(), front.key());
        let expected = format!("conn-{i}");
        assert_eq!(read_exactly(back, expected.len()).await, expected.as_bytes());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_reaches_peer_as_end_of_stream() {
    let listener = Listener::bind(&[loopback(Proto::Tcp)], fast_engine())
        .await
        .unwrap();
    let (proto, addr) = listener.local_addrs()[0];
    let dialer = Dialer::new(fast_engine());
    dialer.setup(&[endpoint(proto, addr)]);

    let (front, back) = pair(&listener, &dialer).await;
    front.write(b"last words").await.unwrap();
    front.close().await.unwrap();
    assert!(matches!(front.write(b"more").await, Err(ConnError::Closed)));

    assert_eq!(read_exactly(&back, 10).await, b"last words");
    let mut buf = [0u8; 16];
    let eof = tokio::time::timeout(Duration::from_secs(5), back.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(eof, 0);
    assert!(matches!(back.read(&mut buf).await, Err(ConnError::Closed)));

    // The backend's own close is answered nowhere but must not fail.
    back.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_link_redialed_once_backend_appears() {
    let port = free_port().await;
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let dialer = Dialer::new(fast_engine());
    dialer.setup(&[endpoint(Proto::Tcp, addr)]);

    // Nothing is listening yet.
    let early = dialer.dial_timeout(Duration::from_millis(150)).await;
    assert!(early.is_err());
    assert_eq!(dialer.pool().alive_count(), 0);

    let listener = Listener::bind(&[endpoint(Proto::Tcp, addr)], fast_engine())
        .await
        .unwrap();
    let (front, back) = pair(&listener, &dialer).await;
    front.write(b"after redial").await.unwrap();
    assert_eq!(read_exactly(&back, 12).await, b"after redial");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_link_death_falls_back_to_remaining_link() {
    let survivor = Listener::bind(&[loopback(Proto::Tcp)], fast_engine())
        .await
        .unwrap();
    let doomed = Listener::bind(&[loopback(Proto::Tcp)], fast_engine())
        .await
        .unwrap();
    let links = vec![
        endpoint(Proto::Tcp, survivor.local_addrs()[0].1),
        endpoint(Proto::Tcp, doomed.local_addrs()[0].1),
    ];
    let dialer = Dialer::new(fast_engine());
    dialer.setup(&links);

    // Wait for both links.
    tokio::time::timeout(Duration::from_secs(5), async {
        while dialer.pool().alive_count() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Kill one backend; its link goes down once the read loop notices.
    drop(doomed);
    tokio::time::timeout(Duration::from_secs(5), async {
        while dialer.pool().alive_count() > 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let (front, back) = pair(&survivor, &dialer).await;
    front.write(b"still here").await.unwrap();
    assert_eq!(read_exactly(&back, 10).await, b"still here");
}

/// Forward TCP connections to `target` until the returned task is aborted.
///
/// Aborting drops the listener and every relayed connection, like a path
/// going away.
async fn relay(target: SocketAddr) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = l.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let mut relayed = tokio::task::JoinSet::new();
        while let Ok((mut inbound, _)) = l.accept().await {
            relayed.spawn(async move {
                if let Ok(mut outbound) = TcpStream::connect(target).await {
                    let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                }
            });
        }
    });
    (addr, task)
}

async fn wait_for_alive_count(dialer: &Dialer, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while dialer.pool().alive_count() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("link count never settled");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stream_survives_link_death_mid_connection() {
    let listener = Listener::bind(&[loopback(Proto::Tcp), loopback(Proto::Tcp)], fast_engine())
        .await
        .unwrap();
    let direct = listener.local_addrs()[0].1;
    let (relayed, path) = relay(listener.local_addrs()[1].1).await;

    let dialer = Dialer::new(fast_engine());
    dialer.setup(&[endpoint(Proto::Tcp, direct), endpoint(Proto::Tcp, relayed)]);
    wait_for_alive_count(&dialer, 2).await;

    let (front, back) = pair(&listener, &dialer).await;
    let chunk = |i: u32| -> Vec<u8> { (0..1000u32).map(|b| ((i * 7 + b) % 251) as u8).collect() };

    // Striped over both links.
    let mut sent = Vec::new();
    for i in 0..10 {
        front.write(&chunk(i)).await.unwrap();
        sent.extend(chunk(i));
    }
    let mut received = read_exactly(&back, sent.len()).await;

    // One path dies; the same connection carries on over the other.
    path.abort();
    wait_for_alive_count(&dialer, 1).await;

    let before = sent.len();
    for i in 10..20 {
        front.write(&chunk(i)).await.unwrap();
        sent.extend(chunk(i));
    }
    received.extend(read_exactly(&back, sent.len() - before).await);
    assert_eq!(received, sent);

    // Replies go out only once the backend has dropped the dead path too.
    let replies = listener.node().pool_for(front.key().sender_id).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while replies.len() != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    back.write(b"ack").await.unwrap();
    assert_eq!(read_exactly(&front, 3).await, b"ack");
}

async fn echo_server() -> SocketAddr {
    let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = l.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = l.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_accelerated_tcp_echo() {
    let service = echo_server().await;
    let link_port = free_port().await;
    let app_port = free_port().await;
    let (stop_tx, stop_rx) = watch::channel(false);

    let backend = tokio::spawn(run_backend(
        BackendConfig {
            listen: format!("tcp://127.0.0.1:{link_port}"),
            upstream: format!("tcp://{service}"),
            engine: fast_engine(),
        },
        stop_rx.clone(),
        Box::new(|_| {}),
    ));
    let frontend = tokio::spawn(run_frontend(
        FrontendConfig {
            listen: format!("tcp://127.0.0.1:{app_port}"),
            upstream: format!("tcp://127.0.0.1:{link_port}"),
            engine: fast_engine(),
        },
        stop_rx,
        Box::new(|_| {}),
    ));

    let mut app = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match TcpStream::connect(("127.0.0.1", app_port)).await {
                Ok(s) => break s,
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    })
    .await
    .unwrap();

    app.write_all(b"hello through the tunnel").await.unwrap();
    let mut buf = [0u8; 24];
    tokio::time::timeout(Duration::from_secs(5), app.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello through the tunnel");
    drop(app);

    stop_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), frontend)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), backend)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
