//! Backend listener: accept loop and per-connection handling.

use crate::config::{Config, Scheduling};
use crate::error::BackendError;
use crate::handler::{Outcome, Responder};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use vrelay_protocol::{Encoder, Framing, MessageBuffer, DEFAULT_CHUNK_SIZE, MAX_PAYLOAD_SIZE};
use vrelay_transport::{
    read_message, write_message, Accept, Endpoint, PeerAddr, ReadUntil, RelayListener,
    VMADDR_CID_ANY,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Endpoint to listen on.
    pub endpoint: Endpoint,
    /// Inbound framing.
    pub framing: Framing,
    /// Size of each socket read.
    pub chunk_size: usize,
    /// Time allowed to receive a whole envelope.
    pub read_timeout: Duration,
    /// Largest envelope accepted.
    pub max_message_bytes: usize,
    /// Connection scheduling.
    pub scheduling: Scheduling,
    /// Connections in flight under concurrent scheduling.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::vsock(VMADDR_CID_ANY, vrelay_protocol::DEFAULT_BACKEND_PORT as u32),
            framing: Framing::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_timeout: Duration::from_secs(30),
            max_message_bytes: MAX_PAYLOAD_SIZE as usize,
            scheduling: Scheduling::default(),
            max_connections: 64,
        }
    }
}

impl ServerConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ..Default::default()
        }
    }
}

impl From<&Config> for ServerConfig {
    fn from(config: &Config) -> Self {
        Self {
            endpoint: config.listen.clone(),
            framing: config.connection.framing,
            chunk_size: config.connection.chunk_size,
            read_timeout: config.connection.read_timeout(),
            max_message_bytes: config.connection.max_message_bytes,
            scheduling: config.connection.scheduling,
            max_connections: config.connection.max_connections,
        }
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub replies_total: AtomicU64,
    pub fallbacks_total: AtomicU64,
    pub errors_total: AtomicU64,
}

impl ServerStats {
    fn record(&self, outcome: Outcome) {
        match outcome {
            Outcome::Decoded => {
                self.replies_total.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Fallback => {
                self.fallbacks_total.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Failed => {
                self.replies_total.fetch_add(1, Ordering::Relaxed);
                self.errors_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Backend server.
pub struct Server {
    config: ServerConfig,
    responder: Responder,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server answering with `responder`.
    pub fn new(config: ServerConfig, responder: Responder) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            responder,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Creates a server serving the built-in routes.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            ServerConfig::from(config),
            Responder::with_routes(config.server_name.clone()),
        )
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the configured endpoint.
    pub async fn bind(&self) -> Result<RelayListener, BackendError> {
        RelayListener::bind(&self.config.endpoint)
            .await
            .map_err(|source| BackendError::Bind {
                endpoint: self.config.endpoint.clone(),
                source,
            })
    }

    /// Binds and serves until shutdown.
    pub async fn run(&self) -> Result<(), BackendError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener until shutdown.
    ///
    /// A failed accept is logged and counted; the loop keeps listening.
    pub async fn serve<L: Accept>(&self, mut listener: L) -> Result<(), BackendError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);

        let local = listener
            .local_endpoint()
            .unwrap_or_else(|_| self.config.endpoint.clone());
        tracing::info!(
            "Listening on {} ({} framing, {:?} scheduling)",
            local,
            self.config.framing,
            self.config.scheduling
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => self.dispatch(stream, peer).await,
                        Err(e) => {
                            let e = BackendError::Accept(e);
                            tracing::error!("{}", e);
                            self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn dispatch<S>(&self, stream: S, peer: PeerAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match self.config.scheduling {
            Scheduling::Sequential => {
                self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
                Self::serve_connection(stream, peer, &self.responder, &self.config, &self.stats)
                    .await;
                self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            }
            Scheduling::Concurrent => {
                if self.stats.connections_active.load(Ordering::Relaxed)
                    >= self.config.max_connections as u64
                {
                    tracing::warn!("Connection limit reached, rejecting {}", peer);
                    drop(stream);
                    return;
                }

                self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                let responder = self.responder.clone();
                let config = self.config.clone();
                let stats = self.stats.clone();

                tokio::spawn(async move {
                    Self::serve_connection(stream, peer, &responder, &config, &stats).await;
                    stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                });
            }
        }
    }

    async fn serve_connection<S>(
        stream: S,
        peer: PeerAddr,
        responder: &Responder,
        config: &ServerConfig,
        stats: &ServerStats,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tracing::info!("Connection from {}", peer);

        match Self::handle_connection(stream, responder, config).await {
            Ok(Some(outcome)) => stats.record(outcome),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Connection {} error: {}", peer, e);
                stats.errors_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Reads one envelope, writes one reply and closes the stream.
    ///
    /// Returns `None` when the peer sent nothing. The stream is shut down
    /// on every path.
    pub async fn handle_connection<S>(
        mut stream: S,
        responder: &Responder,
        config: &ServerConfig,
    ) -> Result<Option<Outcome>, BackendError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = Self::exchange(&mut stream, responder, config).await;

        if let Err(e) = stream.shutdown().await {
            tracing::debug!("Shutdown error while closing connection: {}", e);
        }

        result
    }

    async fn exchange<S>(
        stream: &mut S,
        responder: &Responder,
        config: &ServerConfig,
    ) -> Result<Option<Outcome>, BackendError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let buffer = MessageBuffer::new(config.framing).with_max_size(config.max_message_bytes);
        let read = read_message(stream, buffer, config.chunk_size, ReadUntil::Complete);

        let payload = match tokio::time::timeout(config.read_timeout, read).await {
            Ok(result) => result?,
            Err(_) => return Err(BackendError::ReadTimeout(config.read_timeout)),
        };

        if payload.is_empty() {
            tracing::debug!("Peer sent nothing, closing");
            return Ok(None);
        }

        let (outcome, reply) = responder.respond(&payload);
        let encoded = Encoder::encode_payload(reply, config.framing)?;
        write_message(stream, &encoded).await?;

        tracing::info!("Response sent: {} bytes", encoded.len());
        Ok(Some(outcome))
    }

    /// Signals the accept loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::collections::VecDeque;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::task::JoinHandle;
    use tokio_test::io::Builder;
    use vrelay_protocol::Envelope;
    use vrelay_transport::RelayStream;

    fn tcp_config(framing: Framing) -> ServerConfig {
        ServerConfig {
            framing,
            ..ServerConfig::new(Endpoint::tcp("127.0.0.1", 0))
        }
    }

    async fn start(
        config: ServerConfig,
    ) -> (
        Arc<Server>,
        Endpoint,
        JoinHandle<Result<(), BackendError>>,
    ) {
        let server = Arc::new(Server::new(config, Responder::with_routes("enclave")));
        let listener = server.bind().await.unwrap();
        let endpoint = listener.local_endpoint().unwrap();

        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };
        (server, endpoint, task)
    }

    /// Sends `request`, half-closes and reads until the backend closes.
    async fn round_trip(endpoint: &Endpoint, request: &[u8]) -> Vec<u8> {
        let mut stream = RelayStream::connect(endpoint).await.unwrap();
        stream.write_all(request).await.unwrap();
        stream.shutdown().await.unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn test_root_request_over_tcp() {
        let (server, endpoint, task) = start(tcp_config(Framing::Close)).await;

        let reply = round_trip(
            &endpoint,
            br#"{"method":"GET","path":"/","headers":{},"data":null}"#,
        )
        .await;
        let reply: Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(reply["server"], "enclave");
        assert_eq!(reply["request_method"], "GET");

        server.shutdown();
        task.await.unwrap().unwrap();
        assert!(!server.is_running());

        // Sequential accounting is settled once the loop has stopped
        assert_eq!(server.stats().replies_total.load(Ordering::Relaxed), 1);
        assert_eq!(server.stats().connections_total.load(Ordering::Relaxed), 1);
        assert_eq!(server.stats().connections_active.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_echo_request_under_heuristic_framing() {
        let (server, endpoint, task) = start(tcp_config(Framing::Heuristic)).await;

        let reply = round_trip(
            &endpoint,
            br#"{"method":"POST","path":"/echo","headers":{"X-Test":"1"},"data":"hi"}"#,
        )
        .await;
        let reply: Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(reply["echo"], "hi");
        assert_eq!(reply["headers_received"], serde_json::json!({"X-Test": "1"}));

        server.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_heuristic_truncates_at_first_brace_chunk() {
        let mut stream = Builder::new()
            .read(br#"{"method":"POST","path":"/echo","#)
            .read(br#""data":"a}b"#)
            .write(br#"Enclave received: {"method":"POST","path":"/echo","data":"a}b"#)
            .build();

        let outcome = Server::handle_connection(
            &mut stream,
            &Responder::with_routes("enclave"),
            &tcp_config(Framing::Heuristic),
        )
        .await
        .unwrap();

        assert_eq!(outcome, Some(Outcome::Fallback));
    }

    #[tokio::test]
    async fn test_malformed_input_is_echoed() {
        let (server, endpoint, task) = start(tcp_config(Framing::Close)).await;

        let reply = round_trip(&endpoint, b"not json at all").await;
        assert_eq!(reply, b"Enclave received: not json at all");

        server.shutdown();
        task.await.unwrap().unwrap();
        assert_eq!(server.stats().fallbacks_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_empty_input_gets_no_reply() {
        let (server, endpoint, task) = start(tcp_config(Framing::Close)).await;

        let reply = round_trip(&endpoint, b"").await;
        assert!(reply.is_empty());

        let reply = round_trip(&endpoint, br#"{"method":"GET","path":"/x"}"#).await;
        assert!(!reply.is_empty());

        server.shutdown();
        task.await.unwrap().unwrap();
        assert_eq!(server.stats().connections_total.load(Ordering::Relaxed), 2);
        assert_eq!(server.stats().replies_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_read_timeout_closes_connection() {
        let (mut client, server_side) = tokio::io::duplex(64);
        let config = ServerConfig {
            read_timeout: Duration::from_millis(50),
            ..tcp_config(Framing::Close)
        };

        let result =
            Server::handle_connection(server_side, &Responder::with_routes("enclave"), &config)
                .await;
        assert!(matches!(result, Err(BackendError::ReadTimeout(_))));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_message_is_dropped() {
        let (mut client, server_side) = tokio::io::duplex(4096);
        let config = ServerConfig {
            max_message_bytes: 16,
            ..tcp_config(Framing::Close)
        };

        client.write_all(&[b'x'; 64]).await.unwrap();
        client.shutdown().await.unwrap();

        let result =
            Server::handle_connection(server_side, &Responder::with_routes("enclave"), &config)
                .await;
        assert!(matches!(result, Err(BackendError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_echo_of_max_size_input_still_replies() {
        let (mut client, server_side) = tokio::io::duplex(64 * 1024);
        let config = tcp_config(Framing::Close);
        let input = vec![b'x'; MAX_PAYLOAD_SIZE as usize - 4];

        let writer = tokio::spawn(async move {
            client.write_all(&input).await.unwrap();
            client.shutdown().await.unwrap();
            let mut reply = Vec::new();
            client.read_to_end(&mut reply).await.unwrap();
            reply
        });

        let outcome =
            Server::handle_connection(server_side, &Responder::with_routes("enclave"), &config)
                .await
                .unwrap();
        assert_eq!(outcome, Some(Outcome::Fallback));

        let reply = writer.await.unwrap();
        assert_eq!(reply.len(), MAX_PAYLOAD_SIZE as usize);
        assert!(reply.starts_with(b"Enclave received: xxx"));
    }

    #[tokio::test]
    async fn test_length_prefixed_round_trip() {
        let (server, endpoint, task) = start(tcp_config(Framing::LengthPrefixed)).await;

        let envelope = Envelope::new("POST", "/echo").with_body("braces } inside { body");
        let request = Encoder::encode_envelope(&envelope, Framing::LengthPrefixed).unwrap();

        // No half-close: the frame header tells the backend where the envelope ends
        let mut stream = RelayStream::connect(&endpoint).await.unwrap();
        stream.write_all(&request).await.unwrap();
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();

        let mut buffer = MessageBuffer::new(Framing::LengthPrefixed);
        buffer.extend(&raw).unwrap();
        let reply: Value = serde_json::from_slice(&buffer.finish().unwrap()).unwrap();
        assert_eq!(reply["echo"], "braces } inside { body");

        server.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bad_connection_does_not_stop_listener() {
        let (server, endpoint, task) = start(tcp_config(Framing::LengthPrefixed)).await;

        // Corrupt frame: wrong magic
        let reply = round_trip(&endpoint, b"XXXXXXXXXXXXXXXXXXXX").await;
        assert!(reply.is_empty());

        let envelope = Envelope::new("GET", "/");
        let request = Encoder::encode_envelope(&envelope, Framing::LengthPrefixed).unwrap();
        let reply = round_trip(&endpoint, &request).await;
        assert!(!reply.is_empty());
        assert!(server.is_running());

        server.shutdown();
        task.await.unwrap().unwrap();
        assert_eq!(server.stats().errors_total.load(Ordering::Relaxed), 1);
        assert_eq!(server.stats().replies_total.load(Ordering::Relaxed), 1);
    }

    /// Hands out scripted accept results, then waits forever.
    struct ScriptedListener {
        script: VecDeque<std::io::Result<(DuplexStream, PeerAddr)>>,
    }

    impl Accept for ScriptedListener {
        type Stream = DuplexStream;

        fn accept(
            &mut self,
        ) -> impl std::future::Future<Output = std::io::Result<(DuplexStream, PeerAddr)>> + Send
        {
            let next = self.script.pop_front();
            async move {
                match next {
                    Some(result) => result,
                    None => std::future::pending().await,
                }
            }
        }

        fn local_endpoint(&self) -> std::io::Result<Endpoint> {
            Ok(Endpoint::tcp("127.0.0.1", 0))
        }
    }

    #[tokio::test]
    async fn test_failed_accept_does_not_stop_listener() {
        let (mut client, server_side) = tokio::io::duplex(4096);
        client
            .write_all(br#"{"method":"GET","path":"/"}"#)
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let listener = ScriptedListener {
            script: VecDeque::from(vec![
                Err(std::io::Error::from(std::io::ErrorKind::ConnectionAborted)),
                Ok((server_side, PeerAddr::Tcp("127.0.0.1:4000".parse().unwrap()))),
            ]),
        };
        let server = Arc::new(Server::new(
            tcp_config(Framing::Close),
            Responder::with_routes("enclave"),
        ));
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        let reply: Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(reply["request_method"], "GET");
        assert!(server.is_running());

        server.shutdown();
        task.await.unwrap().unwrap();
        assert_eq!(server.stats().errors_total.load(Ordering::Relaxed), 1);
        assert_eq!(server.stats().replies_total.load(Ordering::Relaxed), 1);
        assert_eq!(server.stats().connections_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_concurrent_scheduling_serves_past_stalled_peer() {
        let config = ServerConfig {
            scheduling: Scheduling::Concurrent,
            read_timeout: Duration::from_secs(10),
            ..tcp_config(Framing::Close)
        };
        let (server, endpoint, task) = start(config).await;

        let _stalled = RelayStream::connect(&endpoint).await.unwrap();

        let reply = tokio::time::timeout(
            Duration::from_secs(2),
            round_trip(&endpoint, br#"{"method":"GET","path":"/"}"#),
        )
        .await
        .expect("second connection should not wait for the first");
        let reply: Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(reply["request_method"], "GET");

        server.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_connection_limit() {
        let config = ServerConfig {
            scheduling: Scheduling::Concurrent,
            max_connections: 1,
            read_timeout: Duration::from_secs(10),
            ..tcp_config(Framing::Close)
        };
        let (server, endpoint, task) = start(config).await;

        let _stalled = RelayStream::connect(&endpoint).await.unwrap();
        let mut rejected = RelayStream::connect(&endpoint).await.unwrap();

        let mut rest = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(2), rejected.read_to_end(&mut rest))
            .await
            .expect("rejected connection should be closed");
        assert!(rest.is_empty());
        assert_eq!(server.stats().connections_total.load(Ordering::Relaxed), 1);

        server.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_error() {
        let first = RelayListener::bind(&Endpoint::tcp("127.0.0.1", 0))
            .await
            .unwrap();
        let taken = first.local_endpoint().unwrap();

        let server = Server::new(ServerConfig::new(taken), Responder::with_routes("enclave"));
        let err = server.run().await.unwrap_err();
        assert!(err.is_fatal());
    }
}
