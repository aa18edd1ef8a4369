//! MITM proxy server.
//!
//! Wires the CA, the host filter and the interception pipeline into the
//! engine and runs it until shut down.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::Proxy;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use wiretap_core::OutputSink;

use crate::ca::CaManager;
use crate::error::{ProxyError, Result};
use crate::handler::ExchangeHandler;
use crate::pipeline::{InspectorConfig, InterceptionPipeline};
use crate::DEFAULT_PROXY_PORT;

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to listen on.
    pub addr: SocketAddr,
    /// Where the root CA lives.
    pub ca_manager: CaManager,
    /// What gets traced and how.
    pub inspector: InspectorConfig,
}

impl ProxyConfig {
    /// Listens on all interfaces on the default port, CA in the platform
    /// data directory.
    pub fn new() -> Result<Self> {
        let ca_manager = CaManager::with_default_dir()?;

        Ok(Self {
            addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PROXY_PORT)),
            ca_manager,
            inspector: InspectorConfig::new(),
        })
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Sets the CA manager.
    pub fn with_ca_manager(mut self, ca_manager: CaManager) -> Self {
        self.ca_manager = ca_manager;
        self
    }

    /// Sets the inspector configuration.
    pub fn with_inspector(mut self, inspector: InspectorConfig) -> Self {
        self.inspector = inspector;
        self
    }
}

/// MITM proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
    pipeline: Arc<InterceptionPipeline>,
}

impl ProxyServer {
    /// Creates a server writing records to `sink`.
    ///
    /// Generates the CA on first use.
    pub fn new(config: ProxyConfig, sink: Arc<dyn OutputSink>) -> Result<Self> {
        config.ca_manager.ensure_ca()?;
        let pipeline = Arc::new(InterceptionPipeline::new(config.inspector.clone(), sink));

        Ok(Self { config, pipeline })
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }

    /// Returns the CA certificate path for client installation.
    pub fn ca_cert_path(&self) -> std::path::PathBuf {
        self.config.ca_manager.cert_path()
    }

    /// Returns the shared pipeline.
    pub fn pipeline(&self) -> &Arc<InterceptionPipeline> {
        &self.pipeline
    }

    /// Runs until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await
    }

    /// Runs until `shutdown` completes, then drains open connections.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.addr).await?;
        self.serve(listener, shutdown).await
    }

    async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let authority = self.config.ca_manager.ensure_ca()?;
        let handler = ExchangeHandler::new(self.pipeline.clone());
        let addr = listener.local_addr()?;

        let proxy = Proxy::builder()
            .with_listener(listener)
            .with_ca(authority)
            .with_rustls_connector(default_provider())
            .with_http_handler(handler)
            .with_graceful_shutdown(shutdown)
            .build()
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        tracing::info!("Starting MITM proxy on {}", addr);
        tracing::info!(
            "Intercepting hosts matching {:?}",
            self.config.inspector.host_filter.pattern()
        );
        tracing::info!("CA certificate: {:?}", self.ca_cert_path());

        proxy
            .start()
            .await
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        tracing::info!(
            "Proxy server stopped after {} exchanges",
            self.pipeline.sessions().issued()
        );
        Ok(())
    }

    /// Binds the listen address and serves in the background.
    ///
    /// Returns a handle reporting the bound address (port 0 picks a free
    /// port) that can be used to stop the server.
    pub async fn start(self) -> Result<ProxyHandle> {
        let listener = TcpListener::bind(self.config.addr).await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);

        let handle = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.recv().await;
                tracing::info!("Proxy shutdown signal received");
            };
            if let Err(e) = self.serve(listener, shutdown).await {
                tracing::error!("Proxy error: {}", e);
            }
        });

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use wiretap_core::{HostFilter, MemorySink};

    fn test_config(temp_dir: &TempDir) -> ProxyConfig {
        ProxyConfig {
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ca_manager: CaManager::new(temp_dir.path().join("ca")),
            inspector: InspectorConfig::new(),
        }
    }

    #[test]
    fn proxy_config_with_port() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir).with_port(8888);
        assert_eq!(config.addr.port(), 8888);
    }

    #[test]
    fn proxy_config_with_addr() {
        let temp_dir = TempDir::new().unwrap();
        let addr = SocketAddr::from(([0, 0, 0, 0], 9999));
        let config = test_config(&temp_dir).with_addr(addr);
        assert_eq!(config.addr, addr);
    }

    #[test]
    fn proxy_server_new_generates_ca() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        let server = ProxyServer::new(config, Arc::new(MemorySink::new())).unwrap();

        assert!(server.ca_cert_path().exists());
        assert!(server
            .ca_cert_path()
            .to_string_lossy()
            .contains("wiretap-ca.crt"));
    }

    #[test]
    fn proxy_server_shares_inspector_config() {
        let temp_dir = TempDir::new().unwrap();
        let inspector = InspectorConfig::new()
            .with_host_filter(HostFilter::new(r"\.internal$").unwrap())
            .with_show_body(true);
        let config = test_config(&temp_dir).with_inspector(inspector);

        let server = ProxyServer::new(config, Arc::new(MemorySink::new())).unwrap();

        assert!(server.pipeline().config().show_body);
        assert!(server.pipeline().should_intercept("db.internal"));
        assert!(!server.pipeline().should_intercept("example.com"));
    }

    #[tokio::test]
    async fn proxy_handle_reports_bound_port() {
        let temp_dir = TempDir::new().unwrap();
        let server = ProxyServer::new(test_config(&temp_dir), Arc::new(MemorySink::new())).unwrap();

        let handle = server.start().await.unwrap();
        assert_eq!(handle.addr().ip(), std::net::Ipv4Addr::LOCALHOST);
        assert_ne!(handle.addr().port(), 0);
        TcpStream::connect(handle.addr()).await.unwrap();

        handle.stop().await;
    }

    /// Serves one connection: reads a request ending in `expect`, answers
    /// 200 with `pong`.
    async fn pong_upstream(expect: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !(contains(&request, b"\r\n\r\n") && request.ends_with(expect)) {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "upstream saw EOF before the full request");
                request.extend_from_slice(&buf[..n]);
            }
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 4\r\n\r\npong",
                )
                .await
                .unwrap();
            stream.flush().await.unwrap();
        });

        addr
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    /// Reads from `stream` until the bytes seen so far satisfy `done`.
    async fn read_until(stream: &mut TcpStream, done: impl Fn(&[u8]) -> bool) -> String {
        let mut seen = Vec::new();
        let mut buf = [0u8; 1024];
        tokio::time::timeout(Duration::from_secs(10), async {
            while !done(&seen) {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "connection closed early: {:?}", String::from_utf8_lossy(&seen));
                seen.extend_from_slice(&buf[..n]);
            }
        })
        .await
        .expect("timed out waiting for the proxy");
        String::from_utf8_lossy(&seen).into_owned()
    }

    async fn start_recording(
        temp_dir: &TempDir,
        inspector: InspectorConfig,
    ) -> (ProxyHandle, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let config = test_config(temp_dir).with_inspector(inspector);
        let server = ProxyServer::new(config, sink.clone()).unwrap();
        (server.start().await.unwrap(), sink)
    }

    fn position(records: &[String], prefix: &str) -> usize {
        records
            .iter()
            .position(|r| r.starts_with(prefix))
            .unwrap_or_else(|| panic!("no record starting with {prefix:?} in {records:#?}"))
    }

    #[tokio::test]
    async fn plain_http_exchange_is_traced_through_the_engine() {
        let temp_dir = TempDir::new().unwrap();
        // The filter only applies to CONNECT targets.
        let inspector = InspectorConfig::new()
            .with_host_filter(HostFilter::new(r"^never\.").unwrap())
            .with_show_body(true)
            .with_show_headers(true);
        let (proxy, sink) = start_recording(&temp_dir, inspector).await;
        let upstream = pong_upstream(b"ping").await;

        let mut client = TcpStream::connect(proxy.addr()).await.unwrap();
        let request = format!(
            "GET http://{upstream}/ping HTTP/1.1\r\nhost: {upstream}\r\ncontent-length: 4\r\n\r\nping"
        );
        client.write_all(request.as_bytes()).await.unwrap();
        let response = read_until(&mut client, |seen| seen.ends_with(b"pong")).await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");

        let records = sink.records();
        let request_line = position(&records, "[001] 127.0.0.1:");
        let request_headers = position(&records, "[001] request headers:");
        let request_body = position(&records, "[001] request body (4 bytes): ping");
        let response_line = position(&records, "[001] 200 OK GET ");
        let response_headers = position(&records, "[001] response headers:");
        let response_body = position(&records, "[001] response body (4 bytes): pong");

        assert!(records[request_line].ends_with(&format!("GET http://{upstream}/ping")));
        assert!(request_line < request_headers);
        assert!(request_headers < request_body);
        assert!(request_body < response_line);
        assert!(response_line < response_headers);
        assert!(response_headers < response_body);
        assert!(records[response_headers].contains("content-type: text/plain"));

        drop(client);
        proxy.stop().await;
    }

    #[tokio::test]
    async fn refused_upstream_gets_502_and_error_record() {
        let temp_dir = TempDir::new().unwrap();
        let (proxy, sink) = start_recording(&temp_dir, InspectorConfig::new()).await;
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let mut client = TcpStream::connect(proxy.addr()).await.unwrap();
        let request = format!("GET http://{closed}/ HTTP/1.1\r\nhost: {closed}\r\n\r\n");
        client.write_all(request.as_bytes()).await.unwrap();
        let response = read_until(&mut client, |seen| contains(seen, b"\r\n\r\n")).await;
        assert!(response.starts_with("HTTP/1.1 502"), "{response}");

        let records = sink.records();
        let error = position(&records, "[001] upstream error GET ");
        assert!(records[error].contains(&format!("http://{closed}/")));
        assert_eq!(records.len(), 2);

        drop(client);
        proxy.stop().await;
    }

    #[tokio::test]
    async fn unmatched_connect_is_tunneled_untraced() {
        let temp_dir = TempDir::new().unwrap();
        let inspector = InspectorConfig::new()
            .with_host_filter(HostFilter::new(r"^never\.").unwrap())
            .with_show_body(true);
        let (proxy, sink) = start_recording(&temp_dir, inspector).await;
        let upstream = pong_upstream(b"\r\n\r\n").await;

        let mut client = TcpStream::connect(proxy.addr()).await.unwrap();
        let connect = format!("CONNECT {upstream} HTTP/1.1\r\nhost: {upstream}\r\n\r\n");
        client.write_all(connect.as_bytes()).await.unwrap();
        let reply = read_until(&mut client, |seen| contains(seen, b"\r\n\r\n")).await;
        assert!(reply.starts_with("HTTP/1.1 200"), "{reply}");

        // Bytes in the tunnel reach the upstream as sent.
        let request = format!("GET /ping HTTP/1.1\r\nhost: {upstream}\r\n\r\n");
        client.write_all(request.as_bytes()).await.unwrap();
        let response = read_until(&mut client, |seen| seen.ends_with(b"pong")).await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");

        assert!(sink.is_empty(), "{:#?}", sink.records());

        drop(client);
        proxy.stop().await;
    }
}
