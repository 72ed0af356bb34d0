use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::pipeline::Pipeline;

/// How long open connections may keep running after shutdown is signalled
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// The development server: accepts connections and runs each request
/// through the pipeline
pub struct DevServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    pipeline: Arc<Pipeline>,
    shutdown_rx: watch::Receiver<bool>,
    grace_period: Duration,
}

impl DevServer {
    /// Bind the listening socket. Port 0 picks an ephemeral port.
    pub async fn bind(
        bind_addr: SocketAddr,
        pipeline: Arc<Pipeline>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", bind_addr, e))?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            pipeline,
            shutdown_rx,
            grace_period: DEFAULT_GRACE_PERIOD,
        })
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until shutdown, then let open connections finish
    /// their in-flight requests for up to the grace period.
    pub async fn run(self) -> anyhow::Result<()> {
        let DevServer {
            listener,
            local_addr,
            pipeline,
            mut shutdown_rx,
            grace_period,
        } = self;

        info!(addr = %local_addr, "Dev server listening (HTTP/1.1 and HTTP/2)");

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let pipeline = Arc::clone(&pipeline);
                            let shutdown_rx = shutdown_rx.clone();
                            connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, pipeline, shutdown_rx).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Dev server shutting down");
                        break;
                    }
                }
            }
        }

        drop(listener);

        if !connections.is_empty() {
            info!(open = connections.len(), "Waiting for open connections");
            let drain = async { while connections.join_next().await.is_some() {} };
            if tokio::time::timeout(grace_period, drain).await.is_err() {
                warn!(
                    open = connections.len(),
                    "Grace period elapsed, closing remaining connections"
                );
                connections.abort_all();
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    pipeline: Arc<Pipeline>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let pipeline = Arc::clone(&pipeline);
        async move { Ok::<_, hyper::Error>(pipeline.handle(req, addr).await) }
    });

    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder.http1().preserve_header_case(true);
    builder.http2().max_concurrent_streams(250);

    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    // On shutdown, finish the request in flight and then close
    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown_rx.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    result.map_err(|e| anyhow::anyhow!("Connection error: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let pipeline = Arc::new(Pipeline::from_config(&Config::default()).unwrap());
        let (_tx, rx) = watch::channel(false);

        let server = DevServer::bind("127.0.0.1:0".parse().unwrap(), pipeline, rx)
            .await
            .unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let pipeline = Arc::new(Pipeline::from_config(&Config::default()).unwrap());
        let (tx, rx) = watch::channel(false);

        let server = DevServer::bind("127.0.0.1:0".parse().unwrap(), pipeline, rx)
            .await
            .unwrap();
        let handle = tokio::spawn(server.run());

        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server should stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_run_closes_idle_connections_on_shutdown() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let pipeline = Arc::new(Pipeline::from_config(&Config::default()).unwrap());
        let (tx, rx) = watch::channel(false);

        let server = DevServer::bind("127.0.0.1:0".parse().unwrap(), pipeline, rx)
            .await
            .unwrap()
            .with_grace_period(Duration::from_secs(30));
        let addr = server.local_addr();
        let handle = tokio::spawn(server.run());

        // Keep-alive connection left idle after one request
        let mut idle = TcpStream::connect(addr).await.unwrap();
        idle.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 1024];
        let read = idle.read(&mut buf).await.unwrap();
        assert!(buf[..read].starts_with(b"HTTP/1.1 "));

        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("idle connection should not hold shutdown for the grace period")
            .unwrap();
        assert!(result.is_ok());

        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), idle.read_to_end(&mut rest))
            .await
            .expect("connection should be closed")
            .ok();
    }

    #[tokio::test]
    async fn test_grace_period_bounds_stalled_connections() {
        use tokio::io::AsyncWriteExt;

        let pipeline = Arc::new(Pipeline::from_config(&Config::default()).unwrap());
        let (tx, rx) = watch::channel(false);

        let server = DevServer::bind("127.0.0.1:0".parse().unwrap(), pipeline, rx)
            .await
            .unwrap()
            .with_grace_period(Duration::from_millis(200));
        let addr = server.local_addr();
        let handle = tokio::spawn(server.run());

        // A request head that never completes
        let mut stalled = TcpStream::connect(addr).await.unwrap();
        stalled.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server should stop once the grace period elapses")
            .unwrap();
        assert!(result.is_ok());
    }
}
