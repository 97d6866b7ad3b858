#![deny(missing_docs)]
//! The in-sandbox credential proxy.
//!
//! Runs inside the VM as the privileged user and is the only process that
//! ever holds the real API keys there. The agent talks to loopback ports,
//! authenticating with its per-session placeholder token; the proxy strips
//! every inbound auth header, injects the real key in the provider's
//! canonical header, and forwards over TLS to the pinned upstream host.
//! Responses stream back in small flushed chunks so server-sent-event
//! bodies arrive as they are produced.
//!
//! Configuration arrives once, on standard input, as a JSON document —
//! never via argv, environment, or disk. After every listener is bound the
//! proxy emits a one-line readiness marker on standard error; it serves
//! nothing before that point.
//!
//! Per request the proxy enforces:
//! - request-line target free of CR/LF (400)
//! - no `Transfer-Encoding` on the way in (400; chunked ingestion is how
//!   request smuggling starts)
//! - `Content-Length` ≤ 100 MB (413)
//! - a 60 s socket deadline, one request per connection, `Connection: close`
//! - exact placeholder-token match, constant-time, same 401 body whether
//!   the token is missing or wrong
//! - a `Host:` that is loopback or the pinned upstream, nothing else
//!
//! Error responses carry short fixed bodies. No exception text, no
//! stack traces, no secret material, under any condition.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use thiserror::Error;

pub mod http;
pub mod relay;
pub mod upstream;

/// Fixed prefix of the readiness marker line on stderr.
pub const READY_PREFIX: &str = "primordial-proxy ready";

/// Largest request body the proxy will ingest.
pub const MAX_BODY_BYTES: u64 = 100 * 1024 * 1024;

/// Streaming chunk size. Small on purpose: server-sent events must reach
/// the agent as they are produced, not when a buffer happens to fill.
pub const STREAM_CHUNK_BYTES: usize = 8 * 1024;

/// Default per-request socket deadline, seconds.
pub const DEFAULT_SOCKET_TIMEOUT_SECS: u64 = 60;

/// Proxy failures. Per-request conditions surface to the agent as an HTTP
/// status with a fixed body; these are the process-level errors.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The stdin configuration document did not parse.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A listener could not be bound.
    #[error("bind failed on port {port}: {reason}")]
    Bind {
        /// The requested port.
        port: u16,
        /// The OS error.
        reason: String,
    },

    /// Socket I/O failed outside a request context.
    #[error("i/o error: {0}")]
    Io(String),
}

/// One provider route.
#[derive(Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Provider name, for log lines only.
    pub provider: String,
    /// Loopback port to listen on. 0 picks an ephemeral port (tests).
    pub listen_port: u16,
    /// Pinned upstream host. The only place forwards may go.
    pub upstream_host: String,
    /// Upstream TCP port.
    #[serde(default = "default_upstream_port")]
    pub upstream_port: u16,
    /// `"bearer"` for `Authorization: Bearer`, otherwise a header name.
    pub auth_header: String,
    /// The real key, injected outbound. Never logged.
    pub secret: String,
    /// TLS to the upstream. Always true in production; loopback
    /// integration tests disable it to stand up a plaintext upstream.
    #[serde(default = "default_true")]
    pub upstream_tls: bool,
}

fn default_upstream_port() -> u16 {
    443
}

fn default_true() -> bool {
    true
}

impl RouteConfig {
    /// Whether this route authenticates upstream with `Authorization: Bearer`.
    pub fn is_bearer(&self) -> bool {
        self.auth_header == "bearer"
    }

    /// The inbound header name carrying the placeholder token (lowercase).
    pub fn inbound_auth_header(&self) -> &str {
        if self.is_bearer() {
            "authorization"
        } else {
            &self.auth_header
        }
    }
}

impl std::fmt::Debug for RouteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteConfig")
            .field("provider", &self.provider)
            .field("listen_port", &self.listen_port)
            .field("upstream_host", &self.upstream_host)
            .field("upstream_port", &self.upstream_port)
            .field("auth_header", &self.auth_header)
            .field("secret", &"[REDACTED]")
            .field("upstream_tls", &self.upstream_tls)
            .finish()
    }
}

/// The whole configuration document, read once from stdin.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// The per-session placeholder token every route accepts.
    pub session_token: String,
    /// One route per provider.
    pub routes: Vec<RouteConfig>,
    /// Per-request socket deadline, seconds.
    #[serde(default = "default_socket_timeout")]
    pub socket_timeout_secs: u64,
}

fn default_socket_timeout() -> u64 {
    DEFAULT_SOCKET_TIMEOUT_SECS
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("session_token", &"[REDACTED]")
            .field("routes", &self.routes)
            .field("socket_timeout_secs", &self.socket_timeout_secs)
            .finish()
    }
}

impl ProxyConfig {
    /// Parse the stdin configuration document.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ProxyError> {
        let config: ProxyConfig =
            serde_json::from_slice(bytes).map_err(|e| ProxyError::Config(e.to_string()))?;
        if config.session_token.is_empty() {
            return Err(ProxyError::Config("empty session token".into()));
        }
        if config.routes.is_empty() {
            return Err(ProxyError::Config("no routes".into()));
        }
        Ok(config)
    }
}

/// A running proxy: every listener bound, accept loops live.
pub struct ProxyServer {
    ports: Vec<u16>,
    handles: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl ProxyServer {
    /// The bound port of each route, in route order.
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// The readiness marker line for stderr.
    pub fn ready_line(&self) -> String {
        let ports: Vec<String> = self.ports.iter().map(|p| p.to_string()).collect();
        format!("{READY_PREFIX} ports={}", ports.join(","))
    }

    /// Ask the accept loops to stop. In-flight connections are abandoned to
    /// their socket deadlines; listeners stop accepting on their next wake.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Block until every accept loop exits.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

/// Bind every route's listener, then start accepting. Nothing is served
/// until every bind has succeeded — a partial proxy would leave some
/// providers' placeholder tokens answered by nobody and others live, and
/// the orchestrator could not tell the difference.
pub fn serve(config: ProxyConfig) -> Result<ProxyServer, ProxyError> {
    let config = Arc::new(config);
    let shutdown = Arc::new(AtomicBool::new(false));
    let request_counter = Arc::new(AtomicU64::new(0));

    // Phase one: bind everything.
    let mut listeners = Vec::with_capacity(config.routes.len());
    let mut ports = Vec::with_capacity(config.routes.len());
    for route in &config.routes {
        let listener =
            TcpListener::bind(("127.0.0.1", route.listen_port)).map_err(|e| ProxyError::Bind {
                port: route.listen_port,
                reason: e.to_string(),
            })?;
        let port = listener
            .local_addr()
            .map_err(|e| ProxyError::Io(e.to_string()))?
            .port();
        ports.push(port);
        listeners.push(listener);
    }

    // Phase two: accept.
    let mut handles = Vec::with_capacity(listeners.len());
    for (listener, route) in listeners.into_iter().zip(config.routes.iter().cloned()) {
        let config = Arc::clone(&config);
        let shutdown = Arc::clone(&shutdown);
        let counter = Arc::clone(&request_counter);
        handles.push(std::thread::spawn(move || {
            accept_loop(listener, route, config, shutdown, counter);
        }));
    }

    Ok(ProxyServer {
        ports,
        handles,
        shutdown,
    })
}

fn accept_loop(
    listener: TcpListener,
    route: RouteConfig,
    config: Arc<ProxyConfig>,
    shutdown: Arc<AtomicBool>,
    counter: Arc<AtomicU64>,
) {
    for conn in listener.incoming() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let stream = match conn {
            Ok(s) => s,
            Err(_) => continue,
        };
        let route = route.clone();
        let config = Arc::clone(&config);
        let counter = Arc::clone(&counter);
        std::thread::spawn(move || {
            let seq = counter.fetch_add(1, Ordering::Relaxed);
            let status = relay::handle_connection(stream, &route, &config);
            // Debug log line: provider, sequence, outcome. Never the
            // target path (query strings carry payload) and never header
            // values.
            let mut err = std::io::stderr().lock();
            let _ = writeln!(
                err,
                "primordial-proxy[{}] request #{seq} -> {status}",
                route.provider
            );
        });
    }
}
