//! Diagnostics endpoint — accept loop and per-connection handler.
//!
//! A minimal HTTP/1.1 listener that answers every request with one JSON
//! document: the container identity plus a snapshot of every metrics
//! registry. Runs for the lifetime of the process when
//! `container.diagnostics.port` is configured.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::metrics::MetricsRegistry;
use crate::types::Result;

const READ_TIMEOUT: Duration = Duration::from_secs(2);

pub struct DiagnosticsServer {
    addr: SocketAddr,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl DiagnosticsServer {
    /// Bind the port and spawn the accept loop.
    pub async fn start(
        port: u16,
        container: String,
        run_id: String,
        registries: Vec<Arc<MetricsRegistry>>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let addr = listener.local_addr()?;
        let token = CancellationToken::new();

        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            accept_loop(listener, loop_token, container, run_id, registries).await;
        });

        tracing::info!(%addr, "diagnostics endpoint listening");
        Ok(Self {
            addr,
            token,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn stop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    token: CancellationToken,
    container: String,
    run_id: String,
    registries: Vec<Arc<MetricsRegistry>>,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    if let Err(e) = serve_one(socket, &container, &run_id, &registries).await {
                        tracing::debug!(%peer, error = %e, "diagnostics request failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "diagnostics accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
}

async fn serve_one(
    mut socket: TcpStream,
    container: &str,
    run_id: &str,
    registries: &[Arc<MetricsRegistry>],
) -> std::io::Result<()> {
    // Drain the request head; the response is the same for every path.
    let mut buf = [0u8; 1024];
    let _ = tokio::time::timeout(READ_TIMEOUT, socket.read(&mut buf)).await;

    let body = serde_json::json!({
        "container": container,
        "run_id": run_id,
        "sources": registries.iter().map(|r| r.snapshot()).collect::<Vec<_>>(),
    })
    .to_string();

    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_serves_snapshot_and_stops() {
        let registry = MetricsRegistry::new("container");
        registry.counter("iterations").add(3);

        let mut server = DiagnosticsServer::start(
            0,
            "test-container".to_string(),
            "run-1".to_string(),
            vec![registry],
        )
        .await
        .unwrap();

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nhost: localhost\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["container"], "test-container");
        assert_eq!(json["sources"][0]["counters"]["iterations"], 3);

        server.stop().await;
    }
}
