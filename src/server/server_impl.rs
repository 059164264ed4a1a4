use crate::{
    errors::{Error, HandlerError, Result},
    http::request::{ConnInfo, Request},
    limits::{ConnLimits, ReqLimits, RespLimits, ServerLimits, SlabPolicy},
    server::{
        callback::{Callback, ErrorHook, Handler, HandlerResult, ListenHook},
        connection::{serve_connection, WorkerCtx},
        date::DateCache,
        slab::RequestSlab,
        transport::{bind_listener, resolve_addr, RemoteAddr, Transport, TransportKind},
    },
};
use crossbeam::sync::WaitGroup;
use std::{
    cell::RefCell,
    fmt,
    future::Future,
    net::SocketAddr,
    path::PathBuf,
    rc::Rc,
    sync::Arc,
    thread,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::{JoinSet, LocalSet},
    time::timeout,
};

#[cfg(feature = "tls")]
type Acceptor = tokio_rustls::TlsAcceptor;
#[cfg(not(feature = "tls"))]
type Acceptor = std::convert::Infallible;

/// Graceful shutdown signal.
///
/// Cloning yields another handle to the same signal. Once triggered the
/// server stops accepting, stops the date ticker, lets in-flight requests
/// finish (bounded by [`ServerLimits::shutdown_timeout`]) and then
/// [`Server::launch`] returns.
///
/// ```no_run
/// use flashline::{Response, Server, Shutdown};
///
/// # #[tokio::main]
/// # async fn main() -> flashline::Result<()> {
/// let shutdown = Shutdown::new();
///
/// let ctrl_c = shutdown.clone();
/// tokio::spawn(async move {
///     let _ = tokio::signal::ctrl_c().await;
///     ctrl_c.trigger();
/// });
///
/// Server::builder()
///     .handler_fn0(|| Ok(Response::text("bye soon")))
///     .signal(shutdown)
///     .build()?
///     .launch()
///     .await
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Fires the signal. Further calls do nothing.
    #[inline]
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    #[inline]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal has fired.
    pub(crate) async fn wait(&mut self) {
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }
}

//

/// Options of [`serve`].
pub struct ServeOptions {
    /// Interface to bind (default: `127.0.0.1`). Empty means every IPv4
    /// interface; IPv6 literals may be bracketed (`[::1]`).
    pub hostname: String,
    /// Port to bind (default: `9000`). `0` picks a free port, reported
    /// through `on_listen`.
    pub port: u16,
    /// Binds one listener per worker on the same port and lets the kernel
    /// spread connections between them. Without it a single worker serves
    /// everything.
    pub reuse_port: bool,
    /// PEM certificate chain. Must be set together with `key`.
    pub cert: Option<PathBuf>,
    /// PEM private key. Must be set together with `cert`.
    pub key: Option<PathBuf>,
    pub signal: Option<Shutdown>,
    /// Maps handler failures to responses (default: `500`).
    pub on_error: Option<ErrorHook>,
    pub on_listen: Option<ListenHook>,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            port: 9000,
            reuse_port: false,
            cert: None,
            key: None,
            signal: None,
            on_error: None,
            on_listen: None,

            _priv: (),
        }
    }
}

impl fmt::Debug for ServeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServeOptions")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("reuse_port", &self.reuse_port)
            .field("cert", &self.cert)
            .field("key", &self.key)
            .field("signal", &self.signal.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_listen", &self.on_listen.is_some())
            .finish()
    }
}

/// Serves `callback` until `options.signal` fires, with default limits.
///
/// ```no_run
/// use flashline::{serve, Callback, Response, ServeOptions};
/// use std::{net::SocketAddr, sync::Arc};
///
/// #[tokio::main]
/// async fn main() -> flashline::Result<()> {
///     let options = ServeOptions {
///         port: 8080,
///         on_listen: Some(Arc::new(|addr: SocketAddr| println!("listening on {addr}"))),
///         ..ServeOptions::default()
///     };
///
///     serve(Callback::no_arg(|| Ok(Response::text("Hello World"))), options).await
/// }
/// ```
pub async fn serve(callback: Callback, options: ServeOptions) -> Result<()> {
    Server::builder()
        .options(options)
        .callback(callback)
        .build()?
        .launch()
        .await
}

//

/// An HTTP/1.1 server.
///
/// # Examples
///
/// ```no_run
/// use flashline::{Request, Response, Server, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> flashline::Result<()> {
///     Server::builder()
///         .hostname("0.0.0.0")
///         .port(8080)
///         .handler_fn(|req: &Request| {
///             Ok(match &req.target()?[..] {
///                 b"/" => Response::text("Hello World"),
///                 _ => Response::new(StatusCode::NotFound),
///             })
///         })
///         .build()?
///         .launch()
///         .await
/// }
/// ```
pub struct Server {
    addr: SocketAddr,
    reuse_port: bool,
    on_listen: Option<ListenHook>,
    shared: Arc<Shared>,
}

/// State every worker starts from.
struct Shared {
    callback: Callback,
    on_error: Option<ErrorHook>,
    tls: Option<Acceptor>,
    date: Option<DateCache>,
    shutdown: Shutdown,

    server_limits: ServerLimits,
    conn_limits: ConnLimits,
    req_limits: ReqLimits,
    resp_limits: RespLimits,
}

impl Server {
    #[inline]
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            options: ServeOptions::default(),
            callback: None,

            server_limits: None,
            connection_limits: None,
            request_limits: None,
            response_limits: None,
        }
    }

    /// Handle to the signal that stops this server.
    #[inline]
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shared.shutdown.clone()
    }

    /// Binds, starts the workers and serves until shutdown has completed.
    pub async fn launch(self) -> Result<()> {
        let limits = &self.shared.server_limits;
        let workers = match self.reuse_port && cfg!(unix) {
            true => limits.workers,
            false => 1,
        };

        let first = bind_listener(self.addr, self.reuse_port)?;
        // With port 0 the later listeners must join the port the first one got
        let local_addr = first.local_addr()?;
        let mut listeners = vec![first];
        for _ in 1..workers {
            listeners.push(bind_listener(local_addr, true)?);
        }

        log::info!("listening on {local_addr} with {workers} worker(s)");
        if let Some(on_listen) = &self.on_listen {
            on_listen(local_addr);
        }

        let wait_group = WaitGroup::new();
        for (index, listener) in listeners.into_iter().enumerate() {
            let shared = self.shared.clone();
            let done = wait_group.clone();

            thread::Builder::new()
                .name(format!("flashline-worker-{index}"))
                .spawn(move || {
                    run_worker(index, listener, shared);
                    drop(done);
                })?;
        }

        let drained = tokio::task::spawn_blocking(move || wait_group.wait());
        let drained = match self.shared.date.clone() {
            Some(date) => {
                let ticker = date.run_ticker(self.shared.shutdown.clone());
                tokio::join!(ticker, drained).1
            }
            None => drained.await,
        };
        drained.map_err(|err| Error::Io(std::io::Error::other(err)))?;

        log::info!("server on {local_addr} stopped");
        Ok(())
    }
}

fn run_worker(index: usize, listener: std::net::TcpListener, shared: Arc<Shared>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!("worker {index}: failed to start runtime: {err}");
            return;
        }
    };

    LocalSet::new().block_on(&runtime, accept_loop(index, listener, shared));
}

async fn accept_loop(index: usize, listener: std::net::TcpListener, shared: Arc<Shared>) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(err) => {
            log::error!("worker {index}: {err}");
            return;
        }
    };

    let ctx = Rc::new(WorkerCtx {
        callback: shared.callback.clone(),
        on_error: shared.on_error.clone(),
        slab: Rc::new(RefCell::new(RequestSlab::new(shared.server_limits.slab))),
        date: shared.date.clone(),
        shutdown: shared.shutdown.clone(),
        json_errors: shared.server_limits.json_errors,

        conn_limits: shared.conn_limits.clone(),
        req_limits: shared.req_limits.clone(),
        resp_limits: shared.resp_limits.clone(),
    });

    let mut shutdown = shared.shutdown.clone();
    let mut connections = JoinSet::new();
    let mut next_id = 0u64;

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    next_id += 1;
                    spawn_connection(&mut connections, stream, remote, next_id, &ctx, shared.tls.as_ref());
                }
                Err(err) => log::warn!("worker {index}: accept failed: {err}"),
            },
            Some(joined) = connections.join_next() => reap(index, joined),
        }
    }

    drop(listener);
    log::debug!("worker {index}: draining {} connection(s)", connections.len());

    let drain = async {
        while let Some(joined) = connections.join_next().await {
            reap(index, joined);
        }
    };
    if timeout(shared.server_limits.shutdown_timeout, drain).await.is_err() {
        log::warn!("worker {index}: aborting {} connection(s)", connections.len());
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }

    let slab = ctx.slab.borrow();
    log::debug!(
        "worker {index}: stopped ({} of {} request slots in use)",
        slab.len(),
        slab.capacity()
    );
}

#[inline]
fn reap(index: usize, joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            log::error!("worker {index}: connection task panicked");
        }
    }
}

fn spawn_connection(
    connections: &mut JoinSet<()>,
    stream: TcpStream,
    remote: SocketAddr,
    id: u64,
    ctx: &Rc<WorkerCtx>,
    tls: Option<&Acceptor>,
) {
    let _ = stream.set_nodelay(true);
    let Ok(local) = stream.local_addr() else {
        return;
    };
    let ctx = ctx.clone();

    match tls {
        None => {
            let info = ConnInfo {
                id,
                remote: RemoteAddr::new(TransportKind::Tcp, remote),
                local,
            };
            connections.spawn_local(serve_connection(Transport::Plain(stream), info, ctx));
        }
        #[cfg(feature = "tls")]
        Some(acceptor) => {
            let acceptor = acceptor.clone();
            let info = ConnInfo {
                id,
                remote: RemoteAddr::new(TransportKind::Tls, remote),
                local,
            };

            connections.spawn_local(async move {
                match timeout(ctx.conn_limits.socket_read_timeout, acceptor.accept(stream)).await {
                    Ok(Ok(tls)) => serve_connection(Transport::Tls(Box::new(tls)), info, ctx).await,
                    Ok(Err(err)) => log::debug!("conn {id}: TLS handshake failed: {err}"),
                    Err(_) => log::debug!("conn {id}: TLS handshake timed out"),
                }
            });
        }
        #[cfg(not(feature = "tls"))]
        Some(never) => match *never {},
    }
}

//

/// Builder for configuring and creating [`Server`] instances.
///
/// Exactly one handler must be set, through any of the `handler*` methods or
/// [`callback`](Self::callback); the last call wins.
pub struct ServerBuilder {
    options: ServeOptions,
    callback: Option<Callback>,

    server_limits: Option<ServerLimits>,
    connection_limits: Option<ConnLimits>,
    request_limits: Option<ReqLimits>,
    response_limits: Option<RespLimits>,
}

impl ServerBuilder {
    #[inline(always)]
    pub fn hostname<S: Into<String>>(mut self, hostname: S) -> Self {
        self.options.hostname = hostname.into();
        self
    }

    #[inline(always)]
    pub fn port(mut self, port: u16) -> Self {
        self.options.port = port;
        self
    }

    /// See [`ServeOptions::reuse_port`].
    #[inline(always)]
    pub fn reuse_port(mut self, reuse_port: bool) -> Self {
        self.options.reuse_port = reuse_port;
        self
    }

    /// Terminates TLS with the given PEM certificate chain and private key.
    #[inline(always)]
    pub fn tls<C: Into<PathBuf>, K: Into<PathBuf>>(mut self, cert: C, key: K) -> Self {
        self.options.cert = Some(cert.into());
        self.options.key = Some(key.into());
        self
    }

    #[inline(always)]
    pub fn signal(mut self, signal: Shutdown) -> Self {
        self.options.signal = Some(signal);
        self
    }

    /// Replaces every option set so far.
    #[inline(always)]
    pub fn options(mut self, options: ServeOptions) -> Self {
        self.options = options;
        self
    }

    /// Maps handler failures to responses. If `f` fails too, the connection
    /// is closed without a response.
    ///
    /// ```no_run
    /// use flashline::{Response, Server, StatusCode};
    ///
    /// let server = Server::builder()
    ///     .handler_fn0(|| Err("database unavailable".into()))
    ///     .on_error(|err| {
    ///         Ok(Response::new(StatusCode::ServiceUnavailable).body(err.to_string()))
    ///     })
    ///     .build();
    /// ```
    #[inline(always)]
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(HandlerError) -> HandlerResult + Send + Sync + 'static,
    {
        self.options.on_error = Some(Arc::new(f));
        self
    }

    /// Called once the listening socket is bound, with its actual address.
    #[inline(always)]
    pub fn on_listen<F>(mut self, f: F) -> Self
    where
        F: Fn(SocketAddr) + Send + Sync + 'static,
    {
        self.options.on_listen = Some(Arc::new(f));
        self
    }

    #[inline(always)]
    pub fn callback(mut self, callback: Callback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Async handler implemented on a type, see [`Handler`].
    #[inline(always)]
    pub fn handler<H: Handler>(self, handler: H) -> Self {
        self.callback(Callback::handler(handler))
    }

    /// Sync handler reading the request.
    #[inline(always)]
    pub fn handler_fn<F>(self, f: F) -> Self
    where
        F: Fn(&Request) -> HandlerResult + Send + Sync + 'static,
    {
        self.callback(Callback::sync(f))
    }

    /// Sync handler ignoring the request.
    #[inline(always)]
    pub fn handler_fn0<F>(self, f: F) -> Self
    where
        F: Fn() -> HandlerResult + Send + Sync + 'static,
    {
        self.callback(Callback::no_arg(f))
    }

    /// Async handler taking the request.
    #[inline(always)]
    pub fn handler_async<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + 'static,
    {
        self.callback(Callback::asynchronous(f))
    }

    /// Async handler ignoring the request.
    #[inline(always)]
    pub fn handler_async0<F, Fut>(self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + 'static,
    {
        self.callback(Callback::async_no_arg(f))
    }

    /// Configures workers, the request slab and shutdown.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use flashline::{Response, Server, limits::{ServerLimits, SlabPolicy}};
    ///
    /// let server = Server::builder()
    ///     .handler_fn0(|| Ok(Response::text("ok")))
    ///     .reuse_port(true)
    ///     .server_limits(ServerLimits {
    ///         // Your changes
    ///         workers: 8,
    ///         slab: SlabPolicy::Growable { initial: 4096 },
    ///         ..ServerLimits::default() // Required line
    ///     })
    ///     .build();
    /// ```
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// Validates the configuration, resolves the address and loads TLS
    /// material. Nothing is bound until [`Server::launch`].
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when:
    /// - no handler was set
    /// - only one of `cert`/`key` was set
    /// - `workers`, `max_pipelined` or a fixed slab capacity is `0`
    ///
    /// [`Error::Tls`] when the certificate or key cannot be loaded.
    pub fn build(self) -> Result<Server> {
        let callback = self
            .callback
            .ok_or(Error::Config("a handler must be set"))?;

        let server_limits = self.server_limits.unwrap_or_default();
        let conn_limits = self.connection_limits.unwrap_or_default();
        if server_limits.workers == 0 {
            return Err(Error::Config("`workers` must be at least 1"));
        }
        if conn_limits.max_pipelined == 0 {
            return Err(Error::Config("`max_pipelined` must be at least 1"));
        }
        if let SlabPolicy::Fixed(0) = server_limits.slab {
            return Err(Error::Config("a fixed slab needs at least 1 slot"));
        }

        let options = self.options;
        let tls = match (&options.cert, &options.key) {
            (Some(cert), Some(key)) => Some(acceptor(cert, key)?),
            (None, None) => None,
            _ => return Err(Error::Config("`cert` and `key` must be set together")),
        };
        let addr = resolve_addr(&options.hostname, options.port)?;

        let date = server_limits.date_header.then(DateCache::new);

        Ok(Server {
            addr,
            reuse_port: options.reuse_port,
            on_listen: options.on_listen,
            shared: Arc::new(Shared {
                callback,
                on_error: options.on_error,
                tls,
                date,
                shutdown: options.signal.unwrap_or_default(),

                server_limits,
                conn_limits,
                req_limits: self.request_limits.unwrap_or_default(),
                resp_limits: self.response_limits.unwrap_or_default(),
            }),
        })
    }
}

#[cfg(feature = "tls")]
#[inline]
fn acceptor(cert: &std::path::Path, key: &std::path::Path) -> Result<Acceptor> {
    crate::tls::acceptor(cert, key)
}

#[cfg(not(feature = "tls"))]
#[inline]
fn acceptor(_: &std::path::Path, _: &std::path::Path) -> Result<Acceptor> {
    Err(Error::Config("built without the `tls` feature"))
}

#[cfg(test)]
mod server_tests {
    use super::*;
    use crate::Response;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn build_rejects_bad_configuration() {
        let ok = || Server::builder().handler_fn0(|| Ok(Response::text("ok")));

        #[rustfmt::skip]
        let cases: [(ServerBuilder, &str); 5] = [
            (Server::builder(),
                "a handler must be set"),
            (ok().options(ServeOptions { cert: Some("cert.pem".into()), ..ServeOptions::default() }),
                "`cert` and `key` must be set together"),
            (ok().server_limits(ServerLimits { workers: 0, ..ServerLimits::default() }),
                "`workers` must be at least 1"),
            (ok().connection_limits(ConnLimits { max_pipelined: 0, ..ConnLimits::default() }),
                "`max_pipelined` must be at least 1"),
            (ok().server_limits(ServerLimits { slab: SlabPolicy::Fixed(0), ..ServerLimits::default() }),
                "a fixed slab needs at least 1 slot"),
        ];

        for (builder, expected) in cases {
            match builder.build() {
                Err(Error::Config(msg)) => assert_eq!(msg, expected),
                Err(other) => panic!("{expected}: unexpected error {other}"),
                Ok(_) => panic!("{expected}: built"),
            }
        }

        assert!(ok().port(0).build().is_ok());
    }

    #[test]
    fn shutdown_is_shared_between_clones() {
        let shutdown = Shutdown::new();
        let other = shutdown.clone();
        assert!(!other.is_triggered());

        shutdown.trigger();
        shutdown.trigger();
        assert!(other.is_triggered());
    }

    #[tokio::test]
    async fn serve_returns_once_signalled() {
        let signal = Shutdown::new();
        signal.trigger();

        let options = ServeOptions {
            port: 0,
            signal: Some(signal),
            ..ServeOptions::default()
        };
        let served = serve(Callback::no_arg(|| Ok(Response::text("ok"))), options);

        timeout(Duration::from_secs(10), served).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn serves_over_loopback() {
        let (addr_tx, addr_rx) = std::sync::mpsc::channel();

        let server = Server::builder()
            .port(0)
            .handler_fn(|req| {
                let target = req.target()?;
                Ok(Response::text(format!(
                    "{} {}",
                    req.method().as_str(),
                    String::from_utf8_lossy(&target)
                )))
            })
            .on_listen(move |addr| {
                let _ = addr_tx.send(addr);
            })
            .build()
            .unwrap();
        let shutdown = server.shutdown_handle();

        let client = async move {
            let addr = tokio::task::spawn_blocking(move || addr_rx.recv().unwrap())
                .await
                .unwrap();

            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"GET /ping HTTP/1.1\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();

            let mut out = String::new();
            stream.read_to_string(&mut out).await.unwrap();
            shutdown.trigger();
            out
        };

        let (launched, out) = tokio::join!(server.launch(), client);
        launched.unwrap();

        assert!(out.starts_with("HTTP/1.1 200 OK\r\nDate: "), "{out}");
        assert!(
            out.ends_with(
                "Content-Type: text/plain;charset=utf-8\r\nConnection: close\r\n\
                 Content-Length: 9\r\n\r\nGET /ping"
            ),
            "{out}"
        );
    }

    #[tokio::test]
    async fn shutdown_lets_running_handler_finish() {
        let (addr_tx, addr_rx) = std::sync::mpsc::channel();

        let server = Server::builder()
            .port(0)
            .handler_async0(|| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(Response::text("late"))
            })
            .on_listen(move |addr| {
                let _ = addr_tx.send(addr);
            })
            .build()
            .unwrap();
        let shutdown = server.shutdown_handle();
        let started = std::time::Instant::now();

        let client = async move {
            let addr = tokio::task::spawn_blocking(move || addr_rx.recv().unwrap())
                .await
                .unwrap();

            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.trigger();

            let mut out = String::new();
            stream.read_to_string(&mut out).await.unwrap();
            out
        };

        let (launched, out) = tokio::join!(server.launch(), client);
        launched.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(out.starts_with("HTTP/1.1 200 OK\r\nDate: "), "{out}");
        assert!(
            out.ends_with("Content-Type: text/plain;charset=utf-8\r\nContent-Length: 4\r\n\r\nlate"),
            "{out}"
        );
    }
}
