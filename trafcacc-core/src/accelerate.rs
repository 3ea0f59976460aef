//! Ready-made TCP accelerator built on [`Dialer`] and [`Listener`].
//!
//! - **frontend**: accepts plain TCP connections on `listen` and carries each
//!   one as a virtual connection over the links in `upstream`
//! - **backend**: accepts links on `listen` and forwards every virtual
//!   connection to the real TCP service at `upstream`

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::conn::Conn;
use crate::control::{BackendConfig, EngineConfig, FrontendConfig, Role};
use crate::dialer::Dialer;
use crate::endpoint::{parse_endpoints, Endpoint};
use crate::listener::Listener;
use crate::transport::Proto;

pub type LogFn = Box<dyn Fn(String) + Send + Sync + 'static>;

/// Copy buffer per direction
const PUMP_BUF_SIZE: usize = 32 * 1024;

/// Run one role until `stop` turns true.
pub async fn accelerate(
    listen: &str,
    upstream: &str,
    role: Role,
    engine: EngineConfig,
    stop: watch::Receiver<bool>,
    log: LogFn,
) -> Result<()> {
    match role {
        Role::Frontend => {
            let cfg = FrontendConfig {
                listen: listen.to_string(),
                upstream: upstream.to_string(),
                engine,
            };
            run_frontend(cfg, stop, log).await
        }
        Role::Backend => {
            let cfg = BackendConfig {
                listen: listen.to_string(),
                upstream: upstream.to_string(),
                engine,
            };
            run_backend(cfg, stop, log).await
        }
    }
}

fn tcp_only(endpoints: &[Endpoint], what: &str) -> Result<Vec<String>> {
    let mut addrs = Vec::new();
    for endpoint in endpoints {
        if endpoint.proto != Proto::Tcp {
            anyhow::bail!("{what} must be tcp, got {endpoint}");
        }
        addrs.extend(endpoint.addrs());
    }
    Ok(addrs)
}

pub async fn run_frontend(cfg: FrontendConfig, mut stop: watch::Receiver<bool>, log: LogFn) -> Result<()> {
    let listen = parse_endpoints(&cfg.listen).context("invalid listen address")?;
    let listen = tcp_only(&listen, "frontend listen address")?;
    let upstreams = parse_endpoints(&cfg.upstream).context("invalid upstream address")?;

    let dialer = Arc::new(Dialer::new(cfg.engine.clone()));
    let links = dialer.setup(&upstreams);
    if links == 0 {
        anyhow::bail!("no upstreams");
    }
    (log.as_ref())(format!(
        "Frontend config: listen={} upstream={} links={links} identity={:08x}",
        cfg.listen,
        cfg.upstream,
        dialer.identity()
    ));

    let accepting = CancellationToken::new();
    let (conn_tx, mut conn_rx) = mpsc::channel::<TcpStream>(64);
    for addr in listen {
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind TCP listener to {addr}"))?;
        (log.as_ref())(format!("Accepting on {}", listener.local_addr()?));
        tokio::spawn(accept_into(listener, conn_tx.clone(), accepting.clone()));
    }
    drop(conn_tx);

    let dial_timeout = cfg.engine.dial_timeout;
    loop {
        tokio::select! {
            stream = conn_rx.recv() => {
                let Some(stream) = stream else { break };
                let dialer = Arc::clone(&dialer);
                tokio::spawn(async move {
                    match dialer.dial_timeout(dial_timeout).await {
                        Ok(conn) => pump(stream, conn).await,
                        Err(e) => tracing::warn!(error = %e, "dropping client connection"),
                    }
                });
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    (log.as_ref())("Stop requested".to_string());
                    break;
                }
            }
        }
    }

    accepting.cancel();
    dialer.shutdown();
    Ok(())
}

pub async fn run_backend(cfg: BackendConfig, mut stop: watch::Receiver<bool>, log: LogFn) -> Result<()> {
    let listen = parse_endpoints(&cfg.listen).context("invalid listen address")?;
    let targets = parse_endpoints(&cfg.upstream).context("invalid upstream address")?;
    let targets = Arc::new(tcp_only(&targets, "backend upstream")?);
    if targets.is_empty() {
        anyhow::bail!("no upstreams");
    }

    let listener = Listener::bind(&listen, cfg.engine.clone())
        .await
        .context("failed to bind link listeners")?;
    (log.as_ref())(format!(
        "Backend config: listen={} upstream={} bound={}",
        cfg.listen,
        cfg.upstream,
        listener.local_addrs().len()
    ));

    let next = AtomicUsize::new(0);
    let connect_timeout = cfg.engine.connect_timeout;
    loop {
        tokio::select! {
            conn = listener.accept() => {
                let Some(conn) = conn else { break };
                let target = targets[next.fetch_add(1, Ordering::Relaxed) % targets.len()].clone();
                tokio::spawn(async move {
                    match tokio::time::timeout(connect_timeout, TcpStream::connect(&target)).await {
                        Ok(Ok(stream)) => pump(stream, conn).await,
                        Ok(Err(e)) => {
                            tracing::warn!(%target, error = %e, "connect to service failed");
                            let _ = conn.close().await;
                        }
                        Err(_) => {
                            tracing::warn!(%target, "connect to service timed out");
                            let _ = conn.close().await;
                        }
                    }
                });
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    (log.as_ref())("Stop requested".to_string());
                    break;
                }
            }
        }
    }

    listener.shutdown();
    Ok(())
}

async fn accept_into(listener: TcpListener, tx: mpsc::Sender<TcpStream>, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "client connected");
                let _ = stream.set_nodelay(true);
                if tx.send(stream).await.is_err() {
                    return;
                }
            }
            Err(e) => tracing::warn!(error = %e, "accept failed"),
        }
    }
}

/// Copy bytes both ways between a TCP stream and a virtual connection.
///
/// Ends when the peer finishes the connection or when the local side is
/// done and everything the peer already sent has been written out.
pub async fn pump(stream: TcpStream, conn: Conn) {
    let conn = Arc::new(conn);
    let key = conn.key();
    let (mut rd, mut wr) = stream.into_split();

    let outbound = {
        let conn = Arc::clone(&conn);
        async move {
            let mut buf = vec![0u8; PUMP_BUF_SIZE];
            loop {
                match rd.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = conn.write(&buf[..n]).await {
                            tracing::debug!(conn = %key, error = %e, "virtual write failed");
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(conn = %key, error = %e, "local read failed");
                        break;
                    }
                }
            }
            let _ = conn.close().await;
        }
    };

    let inbound = {
        let conn = Arc::clone(&conn);
        async move {
            let mut buf = vec![0u8; PUMP_BUF_SIZE];
            loop {
                match conn.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Err(e) = wr.write_all(&buf[..n]).await {
                            tracing::debug!(conn = %key, error = %e, "local write failed");
                            break;
                        }
                    }
                }
            }
            let _ = wr.shutdown().await;
        }
    };

    tokio::pin!(outbound);
    tokio::pin!(inbound);
    let local_done = tokio::select! {
        _ = &mut outbound => true,
        _ = &mut inbound => false,
    };
    if local_done {
        inbound.await;
    }
    let _ = conn.close().await;
    tracing::debug!(conn = %key, "pump finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silent() -> LogFn {
        Box::new(|_| {})
    }

    #[tokio::test]
    async fn test_backend_rejects_udp_service() {
        let (_tx, rx) = watch::channel(false);
        let res = accelerate(
            "tcp://127.0.0.1:0",
            "udp://127.0.0.1:9",
            Role::Backend,
            EngineConfig::default(),
            rx,
            silent(),
        )
        .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_frontend_invalid_upstream() {
        let (_tx, rx) = watch::channel(false);
        let res = accelerate(
            "tcp://127.0.0.1:0",
            "bogus",
            Role::Frontend,
            EngineConfig::default(),
            rx,
            silent(),
        )
        .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_stop_ends_backend() {
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(run_backend(
            BackendConfig {
                listen: "tcp://127.0.0.1:0".into(),
                upstream: "tcp://127.0.0.1:9".into(),
                engine: EngineConfig::default(),
            },
            rx,
            silent(),
        ));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
