//! Public HTTP surface of the gateway.

use crate::config::Config;
use crate::error::GatewayError;
use crate::forwarder::Forwarder;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::Instrument;
use uuid::Uuid;

/// Gateway statistics.
#[derive(Debug, Default)]
pub struct GatewayStats {
    pub requests_total: AtomicU64,
    pub health_checks_total: AtomicU64,
    pub forwarded_total: AtomicU64,
    pub rejected_total: AtomicU64,
    pub transport_errors_total: AtomicU64,
}

/// Routes one HTTP request: health check, rejection, or a backend round trip.
#[derive(Clone)]
pub struct Router {
    forwarder: Arc<Forwarder>,
    server_name: String,
    max_body_bytes: usize,
    stats: Arc<GatewayStats>,
}

impl Router {
    pub fn new(
        forwarder: Forwarder,
        server_name: impl Into<String>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            forwarder: Arc::new(forwarder),
            server_name: server_name.into(),
            max_body_bytes,
            stats: Arc::new(GatewayStats::default()),
        }
    }

    pub fn stats(&self) -> &GatewayStats {
        &self.stats
    }

    /// Handles a request. Always produces a response.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let span = tracing::info_span!("request", id = %Uuid::new_v4());
        self.route(req).instrument(span).await
    }

    async fn route<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.stats.requests_total.fetch_add(1, Ordering::Relaxed);
        let (parts, body) = req.into_parts();
        tracing::info!("{} {}", parts.method, parts.uri.path());

        if parts.uri.path() == "/health" {
            if parts.method != Method::GET && parts.method != Method::HEAD {
                return self.method_not_allowed("GET, HEAD");
            }
            self.stats.health_checks_total.fetch_add(1, Ordering::Relaxed);
            return json_response(
                StatusCode::OK,
                &json!({"status": "healthy", "server": self.server_name}),
            );
        }

        if parts.method != Method::GET && parts.method != Method::POST {
            return self.method_not_allowed("GET, POST");
        }

        let body = match Limited::new(body, self.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                self.stats.rejected_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Request body over {} bytes", self.max_body_bytes);
                return self
                    .error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
            }
            Err(e) => {
                self.stats.rejected_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Failed to read request body: {}", e);
                return self
                    .error_response(StatusCode::BAD_REQUEST, "Failed to read request body");
            }
        };

        let envelope =
            Forwarder::build_envelope(&parts.method, &parts.uri, &parts.headers, &body);

        match self.forwarder.forward(&envelope).await {
            Ok(reply) => {
                self.stats.forwarded_total.fetch_add(1, Ordering::Relaxed);
                let content_type = reply.content_type();
                response(StatusCode::OK, content_type, reply.into_body())
            }
            Err(e) => {
                self.stats
                    .transport_errors_total
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Backend round trip failed: {}", e);
                self.error_response(
                    e.status_code(),
                    &format!("Error communicating with backend: {}", e),
                )
            }
        }
    }

    fn method_not_allowed(&self, allow: &'static str) -> Response<Full<Bytes>> {
        self.stats.rejected_total.fetch_add(1, Ordering::Relaxed);
        let mut response =
            self.error_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static(allow));
        response
    }

    fn error_response(&self, status: StatusCode, message: &str) -> Response<Full<Bytes>> {
        json_response(status, &json!({"error": message, "server": self.server_name}))
    }
}

fn response(
    status: StatusCode,
    content_type: &'static str,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_response(status: StatusCode, value: &Value) -> Response<Full<Bytes>> {
    let body = match serde_json::to_vec(value) {
        Ok(body) => Bytes::from(body),
        Err(e) => {
            tracing::error!("Failed to serialize response: {}", e);
            Bytes::new()
        }
    };
    response(status, "application/json", body)
}

/// HTTP gateway.
pub struct Gateway {
    bind_addr: SocketAddr,
    router: Router,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Gateway {
    pub fn new(bind_addr: SocketAddr, router: Router) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            bind_addr,
            router,
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Creates a gateway from validated configuration.
    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        config.validate()?;
        let forwarder = Forwarder::new(config.forwarder_config()?);
        let router = Router::new(
            forwarder,
            config.http.server_name.clone(),
            config.http.max_body_bytes,
        );
        Ok(Self::new(config.http.bind_addr, router))
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Binds the HTTP listener.
    pub async fn bind(&self) -> Result<TcpListener, GatewayError> {
        TcpListener::bind(self.bind_addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: self.bind_addr,
                source,
            })
    }

    /// Binds and serves until shutdown.
    pub async fn run(&self) -> Result<(), GatewayError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serves HTTP connections until shutdown, one task per connection.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GatewayError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);

        let local = listener.local_addr().unwrap_or(self.bind_addr);
        tracing::info!(
            "Gateway listening on http://{}, forwarding to {}",
            local,
            self.router.forwarder.config().endpoint
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = self.router.clone();
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let router = router.clone();
                                    async move { Ok::<_, Infallible>(router.handle(req).await) }
                                });
                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    tracing::debug!("HTTP connection {} error: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("HTTP accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Gateway shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Signals the accept loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
