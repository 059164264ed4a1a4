//! Server configuration limits and timeouts
//!
//! # Security-First Defaults
//!
//! The defaults are chosen to bound what a single client can cost:
//! - Resource exhaustion attacks
//! - Header flooding
//! - Slowloris attacks
//! - Request smuggling through ambiguous body framing
//!
//! # Memory Consumption
//!
//! Each worker owns one [`RequestSlab`](SlabPolicy); each connection owns a
//! read buffer that starts at [`ReqLimits::initial_buffer`] and a write buffer
//! managed by [`RespLimits`]. Nothing is allocated per request on the hot path
//! beyond what the handler itself allocates.
//!
//! # Examples
//!
//! ```no_run
//! use flashline::{Server, Response, limits::{ConnLimits, ReqLimits, ServerLimits, SlabPolicy}};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> flashline::Result<()> {
//!     Server::builder()
//!         .port(8080)
//!         .handler_fn0(|| Ok(Response::text("Hello World")))
//!         .server_limits(ServerLimits {
//!             workers: 4,
//!             slab: SlabPolicy::Fixed(4096), // Hard ceiling on in-flight requests
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             socket_read_timeout: Duration::from_secs(5),
//!             max_pipelined: 32,
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             header_count: 48,
//!             body_size: 1024 * 1024,
//!             ..ReqLimits::default()
//!         })
//!         .build()?
//!         .launch()
//!         .await
//! }
//! ```

use std::time::Duration;

/// Controls worker fan-out, request slab sizing and shutdown behaviour.
///
/// # Workers
///
/// A worker is one OS thread running its own single-threaded runtime. It owns
/// a listener, a request slab and every connection it accepts; nothing below
/// the listening port is shared between workers.
///
/// ```text
///                 [ port 8080 (SO_REUSEPORT) ]
///                   ||          ||          ||
///              [worker 0]  [worker 1]  [worker 2]
///               slab+conns  slab+conns  slab+conns
/// ```
///
/// Without `reuse_port` exactly one worker is started, whatever `workers` says.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Number of workers when port reuse is enabled (default: `1`).
    pub workers: usize,

    /// Sizing policy of each worker's request slab
    /// (default: [`SlabPolicy::Growable`] with `1024` initial slots).
    pub slab: SlabPolicy,

    /// How long in-flight requests may keep running after shutdown is
    /// requested before their connections are aborted (default: `10 seconds`).
    pub shutdown_timeout: Duration,

    /// Format for the responses the core synthesizes itself (default: `true`)
    ///
    /// If `true`, the fallback `500` and the `503` sent on slab exhaustion
    /// carry a small JSON body:
    /// ```text
    /// HTTP/1.1 503 Service Unavailable\r
    /// Connection: close\r
    /// Content-Length: 72\r
    /// Content-Type: application/json\r
    /// \r
    /// {"error":"Service temporarily unavailable","code":"SERVICE_UNAVAILABLE"}
    /// ```
    /// If `false`, they are sent with an empty body.
    pub json_errors: bool,

    /// Emit a cached `Date` header on every response (default: `true`).
    pub date_header: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            workers: 1,
            slab: SlabPolicy::Growable { initial: 1024 },
            shutdown_timeout: Duration::from_secs(10),
            json_errors: true,
            date_header: true,

            _priv: (),
        }
    }
}

/// Capacity policy of a worker's request slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabPolicy {
    /// Starts with `initial` slots and grows under load. Never refuses a request.
    Growable {
        /// Slots allocated up front.
        initial: usize,
    },

    /// Never holds more than this many in-flight requests. When full, the
    /// connection that asked for a slot is answered with `503` and closed.
    Fixed(usize),
}

impl SlabPolicy {
    #[inline]
    pub(crate) const fn initial(&self) -> usize {
        match *self {
            SlabPolicy::Growable { initial } => initial,
            SlabPolicy::Fixed(capacity) => capacity,
        }
    }
}

/// Per-connection timeouts and reuse limits.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum duration to wait for reading data from socket (default: `5 seconds`)
    ///
    /// Applies while waiting for the next request on an idle keep-alive
    /// connection and while a request head or body is arriving.
    pub socket_read_timeout: Duration,

    /// Maximum duration of a suspending write (default: `5 seconds`)
    ///
    /// The non-suspending fast path is not affected.
    pub socket_write_timeout: Duration,

    /// Maximum number of requests whose handlers run concurrently on one
    /// connection (default: `16`)
    ///
    /// Responses are always written in request order; this only bounds how
    /// far the handlers may run ahead of the writer.
    pub max_pipelined: usize,

    /// Maximum number of requests served per connection (default: `10_000`)
    pub max_requests_per_connection: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_read_timeout: Duration::from_secs(5),
            socket_write_timeout: Duration::from_secs(5),
            max_pipelined: 16,
            max_requests_per_connection: 10_000,

            _priv: (),
        }
    }
}

/// Request parsing limits
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum size of the request line plus headers (default: `8 KB`)
    ///
    /// A head that has not ended within this many bytes is rejected as
    /// malformed and the connection is closed.
    pub head_size: usize,

    /// Maximum number of headers per request (default: `64`)
    pub header_count: usize,

    /// Maximum request body size in bytes (default: `8 MB`)
    ///
    /// Checked against `Content-Length` up front and against the running
    /// total of a chunked body.
    pub body_size: u64,

    /// Initial capacity of each connection's read buffer (default: `4 KB`)
    pub initial_buffer: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            head_size: 8 * 1024,
            header_count: 64,
            body_size: 8 * 1024 * 1024,
            initial_buffer: 4 * 1024,

            _priv: (),
        }
    }
}

/// Configuration for response buffer management.
///
/// Each connection serializes responses into one reused buffer:
/// ```rust
/// # use flashline::limits::RespLimits;
/// # let limits = RespLimits::default();
/// # let mut buffer: Vec<()> = Vec::with_capacity(limits.default_capacity);
/// #
/// if buffer.capacity() > limits.max_capacity {
///     buffer = Vec::with_capacity(limits.default_capacity);
/// } else {
///     buffer.clear();
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Capacity of a fresh write buffer (default: `1024 B`)
    pub default_capacity: usize,
    /// Capacity above which the buffer is reallocated on reset (default: `64 KB`)
    pub max_capacity: usize,
    /// Bodies larger than this are written straight from the caller's bytes
    /// instead of being copied behind the head (default: `16 KB`)
    pub copy_threshold: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_capacity: 1024,
            max_capacity: 64 * 1024,
            copy_threshold: 16 * 1024,

            _priv: (),
        }
    }
}
