//! Per-connection driver.
//!
//! Each connection runs two cooperating halves inside one task:
//!
//! - the **reader** parses requests off the socket, records them in the
//!   worker's request slab and hands their tokens over, in arrival order;
//! - the **dispatcher** invokes the handler for every token as soon as it
//!   arrives and writes the responses back in that same order, whatever order
//!   the handlers finish in.
//!
//! ```text
//! socket -> Reader --(token, bounded by max_pipelined)--> Dispatcher -> socket
//!             |                                              |
//!             +----------------> RequestSlab <---------------+
//! ```

use crate::{
    errors::{Error, ErrorKind, HandlerError, Result, INTERNAL_ERROR_JSON},
    http::{
        parser::{BodyFraming, ChunkedDecoder, Decoded, ParseEvent, Parser},
        request::{ConnInfo, Request},
        response::Response,
        types::{StatusCode, Version},
    },
    limits::{ConnLimits, ReqLimits, RespLimits},
    server::{
        callback::{Callback, ErrorHook, HandlerResult, OnUpgrade, Reply, Upgraded},
        date::DateCache,
        server_impl::Shutdown,
        slab::{BodySource, ConnectionGuard, ParseState, RequestSlab, Token},
        transport::{ConnWriter, Io},
        writer::{Exchange, ResponseWriter, Written},
    },
};
use bytes::{Bytes, BytesMut};
use futures_util::{
    future::{self, FutureExt, LocalBoxFuture},
    stream::{FuturesOrdered, StreamExt},
};
use std::{cell::RefCell, io, rc::Rc};
use tokio::{
    io::{split, AsyncRead, AsyncReadExt, AsyncWrite},
    sync::{
        mpsc::{self, error::TryRecvError},
        oneshot, Notify,
    },
    time::timeout,
};

/// Everything a worker's connections share.
pub(crate) struct WorkerCtx {
    pub(crate) callback: Callback,
    pub(crate) on_error: Option<ErrorHook>,
    pub(crate) slab: Rc<RefCell<RequestSlab>>,
    pub(crate) date: Option<DateCache>,
    pub(crate) shutdown: Shutdown,
    pub(crate) json_errors: bool,

    pub(crate) conn_limits: ConnLimits,
    pub(crate) req_limits: ReqLimits,
    pub(crate) resp_limits: RespLimits,
}

/// Serves one accepted connection until it closes or is upgraded.
pub(crate) async fn serve_connection<I: Io>(io: I, info: ConnInfo, ctx: Rc<WorkerCtx>) {
    let id = info.id;
    let slots = Rc::new(ConnectionGuard::new(ctx.slab.clone(), id));
    log::debug!("conn {id}: open from {}:{}", info.remote.ip, info.remote.port);

    let (rd, wr) = split(io);
    let (tx, rx) = mpsc::channel(ctx.conn_limits.max_pipelined);
    let stop = Notify::new();

    let reader = Reader::new(rd, tx, &ctx, slots.clone(), id);
    let dispatcher = Dispatcher {
        rx,
        writer: ResponseWriter::new(
            ConnWriter::new(wr, ctx.conn_limits.socket_write_timeout),
            ctx.date.clone(),
            ctx.resp_limits.clone(),
        ),
        ctx: ctx.clone(),
        slots,
        conn: Rc::new(info),
    };

    let read = async {
        tokio::select! {
            biased;
            _ = stop.notified() => ReadEnd::Closed,
            end = reader.run() => end,
        }
    };
    let (read_end, handoff) = tokio::join!(read, dispatcher.run(&stop));

    match (read_end, handoff) {
        (ReadEnd::Upgrade(rd, buffered), Some((wr, on_upgrade))) => {
            log::debug!("conn {id}: upgraded ({} bytes carried over)", buffered.len());

            let io = rd.unsplit(wr);
            if let Err(err) = on_upgrade(Upgraded::new(Box::new(io), buffered)).await {
                log::warn!("conn {id}: upgrade: {}", Error::Handler(err));
            }
        }
        (ReadEnd::Failed(err), _) => log::debug!("conn {id}: {err}"),
        _ => {}
    }

    log::debug!("conn {id}: closed");
}

enum Incoming {
    Request {
        token: Token,
        /// Present for upgrade-capable requests: the reader pauses until told
        /// whether to go on (`true`) or to hand the socket over (`false`).
        gate: Option<oneshot::Sender<bool>>,
    },
    /// The slab refused a request; answered with a canned 503.
    Exhausted(Version),
}

// Reader

enum ReadEnd<R> {
    Closed,
    Upgrade(R, Bytes),
    Failed(Error),
}

enum Step {
    Continue,
    Stop,
    Upgrade,
}

const MIN_READ_SPACE: usize = 1024;

struct Reader<R> {
    io: R,
    buf: BytesMut,
    parser: Parser,
    tx: mpsc::Sender<Incoming>,
    slab: Rc<RefCell<RequestSlab>>,
    slots: Rc<ConnectionGuard>,
    shutdown: Shutdown,

    conn: u64,
    served: usize,
    limits: ConnLimits,
    initial_buffer: usize,
    body_size: u64,
}

impl<R: AsyncRead + Unpin> Reader<R> {
    fn new(
        io: R,
        tx: mpsc::Sender<Incoming>,
        ctx: &WorkerCtx,
        slots: Rc<ConnectionGuard>,
        conn: u64,
    ) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(ctx.req_limits.initial_buffer),
            parser: Parser::new(&ctx.req_limits),
            tx,
            slab: ctx.slab.clone(),
            slots,
            shutdown: ctx.shutdown.clone(),

            conn,
            served: 0,
            limits: ctx.conn_limits.clone(),
            initial_buffer: ctx.req_limits.initial_buffer,
            body_size: ctx.req_limits.body_size,
        }
    }

    async fn run(mut self) -> ReadEnd<R> {
        loop {
            match self.next_request().await {
                Ok(Step::Continue) => {}
                Ok(Step::Stop) => return ReadEnd::Closed,
                Ok(Step::Upgrade) => return ReadEnd::Upgrade(self.io, self.buf.freeze()),
                Err(err) => return ReadEnd::Failed(err),
            }
        }
    }

    async fn next_request(&mut self) -> Result<Step> {
        let Some((token, framing)) = self.read_head().await? else {
            return Ok(Step::Stop);
        };

        self.served += 1;
        let last = self.served >= self.limits.max_requests_per_connection;

        let (keep_alive, upgrade, pump, body_tx) = {
            let mut slab = self.slab.borrow_mut();
            let slot = slab.get_mut(token)?;
            if last {
                slot.keep_alive = false;
            }

            let mut body_tx = None;
            let pump = match framing {
                BodyFraming::None => {
                    slot.state = ParseState::Complete;
                    false
                }
                BodyFraming::Length(len) if slot.has_body && self.buf.len() as u64 >= len => {
                    let body = self.buf.split_to(len as usize).freeze();
                    slot.body = BodySource::Buffered(body);
                    slot.state = ParseState::Complete;
                    false
                }
                _ => {
                    // GET and HEAD bodies are read off the wire and dropped
                    if slot.has_body {
                        let (tx, rx) = mpsc::channel(1);
                        slot.body = BodySource::Streaming(rx);
                        body_tx = Some(tx);
                    }
                    slot.state = ParseState::BodyInProgress;
                    true
                }
            };

            (slot.keep_alive, slot.upgrade, pump, body_tx)
        };

        let (gate, gate_rx) = match upgrade {
            true => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            }
            false => (None, None),
        };

        log::trace!("conn {}: request {token} ({framing:?})", self.conn);
        if self.tx.send(Incoming::Request { token, gate }).await.is_err() {
            return Ok(Step::Stop);
        }

        if pump {
            self.pump_body(framing, body_tx).await?;
            if let Ok(slot) = self.slab.borrow_mut().get_mut(token) {
                slot.state = ParseState::Complete;
            }
        }

        if let Some(gate) = gate_rx {
            return Ok(match gate.await {
                Ok(true) if keep_alive => Step::Continue,
                Ok(false) => Step::Upgrade,
                Ok(true) | Err(_) => Step::Stop,
            });
        }

        Ok(match keep_alive {
            true => Step::Continue,
            false => Step::Stop,
        })
    }

    /// Reads until a full head is parsed. `None` means the connection ended
    /// quietly between requests.
    async fn read_head(&mut self) -> Result<Option<(Token, BodyFraming)>> {
        self.parser.reset();
        let mut token = None;

        loop {
            let event = self.parser.feed(&self.buf).inspect_err(|kind| {
                log::debug!("conn {}: rejecting request: {kind}", self.conn);
            })?;

            match event {
                ParseEvent::NeedMoreData => {
                    // Stray line breaks between requests still count as idle
                    let idle = token.is_none() && self.buf.iter().all(|b| matches!(b, b'\r' | b'\n'));
                    if !self.fill(idle).await? {
                        return Ok(None);
                    }
                }
                ParseEvent::RequestLine {
                    method,
                    target,
                    version,
                } => {
                    match self.slots.allocate() {
                        Ok(allocated) => {
                            let mut slab = self.slab.borrow_mut();
                            let slot = slab.get_mut(allocated)?;
                            slot.method = method;
                            slot.target = target;
                            slot.version = version;
                            token = Some(allocated);
                        }
                        Err(Error::ResourceExhausted { capacity }) => {
                            log::warn!("conn {}: all {capacity} request slots in use", self.conn);
                            let _ = self.tx.send(Incoming::Exhausted(version)).await;
                            return Ok(None);
                        }
                        Err(err) => return Err(err),
                    }
                }
                ParseEvent::HeaderComplete { head_len, framing } => {
                    let token = token.ok_or(Error::MalformedRequest("missing request line"))?;
                    let head = self.buf.split_to(head_len).freeze();

                    let mut slab = self.slab.borrow_mut();
                    slab.get_mut(token)?.set_head(head, &self.parser, framing);

                    return Ok(Some((token, framing)));
                }
            }
        }
    }

    /// Moves the body from the socket to the handler. Once the consumer is
    /// gone the rest of the body is still read, and dropped.
    async fn pump_body(
        &mut self,
        framing: BodyFraming,
        mut body_tx: Option<mpsc::Sender<io::Result<Bytes>>>,
    ) -> Result<()> {
        let result = self.forward_body(framing, &mut body_tx).await;

        if let (Err(err), Some(tx)) = (&result, body_tx) {
            let kind = match err {
                Error::TransportClosed => io::ErrorKind::UnexpectedEof,
                _ => io::ErrorKind::InvalidData,
            };
            let _ = tx.send(Err(io::Error::new(kind, err.to_string()))).await;
        }

        result
    }

    async fn forward_body(
        &mut self,
        framing: BodyFraming,
        body_tx: &mut Option<mpsc::Sender<io::Result<Bytes>>>,
    ) -> Result<()> {
        match framing {
            BodyFraming::None => Ok(()),
            BodyFraming::Length(len) => {
                let mut remaining = len;

                while remaining > 0 {
                    if self.buf.is_empty() {
                        self.fill(false).await?;
                    }

                    let take = remaining.min(self.buf.len() as u64);
                    let chunk = self.buf.split_to(take as usize).freeze();
                    remaining -= take;

                    forward(body_tx, chunk).await;
                }

                Ok(())
            }
            BodyFraming::Chunked => {
                let mut decoder = ChunkedDecoder::new(self.body_size);

                loop {
                    match decoder.decode(&mut self.buf)? {
                        Decoded::Data(chunk) => forward(body_tx, chunk).await,
                        Decoded::NeedMoreData => {
                            self.fill(false).await?;
                        }
                        Decoded::Done => return Ok(()),
                    }
                }
            }
        }
    }

    /// Reads more bytes into the buffer.
    ///
    /// Between requests (`idle`) a timeout, end of stream or shutdown is a
    /// normal end and yields `false`. Inside a request they are errors.
    async fn fill(&mut self, idle: bool) -> Result<bool> {
        if self.buf.capacity() - self.buf.len() < MIN_READ_SPACE {
            self.buf.reserve(self.initial_buffer.max(MIN_READ_SPACE));
        }
        let read_timeout = self.limits.socket_read_timeout;

        let read = if idle {
            if self.shutdown.is_triggered() {
                return Ok(false);
            }

            tokio::select! {
                read = timeout(read_timeout, self.io.read_buf(&mut self.buf)) => read,
                _ = self.shutdown.wait() => return Ok(false),
            }
        } else {
            timeout(read_timeout, self.io.read_buf(&mut self.buf)).await
        };

        match read {
            Ok(Ok(0)) if idle => Ok(false),
            Ok(Ok(0)) => Err(Error::TransportClosed),
            Ok(Ok(_)) => Ok(true),
            Ok(Err(err)) => Err(Error::from_io(err)),
            Err(_) if idle => {
                log::trace!("conn {}: idle timeout", self.conn);
                Ok(false)
            }
            Err(_) => Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "socket read timeout",
            ))),
        }
    }
}

#[inline]
async fn forward(body_tx: &mut Option<mpsc::Sender<io::Result<Bytes>>>, chunk: Bytes) {
    if let Some(tx) = body_tx {
        if tx.send(Ok(chunk)).await.is_err() {
            *body_tx = None;
        }
    }
}

// Dispatcher

enum Dispatched {
    Reply {
        token: Token,
        exchange: Exchange,
        gate: Option<oneshot::Sender<bool>>,
        result: HandlerResult,
    },
    Exhausted(Version),
    Broken(Error),
}

enum Admitted {
    Ready(Dispatched),
    Pending(LocalBoxFuture<'static, Dispatched>),
}

enum Exit {
    Close,
    Upgrade(OnUpgrade),
}

type InFlight = FuturesOrdered<LocalBoxFuture<'static, Dispatched>>;

struct Dispatcher<W> {
    rx: mpsc::Receiver<Incoming>,
    writer: ResponseWriter<W>,
    ctx: Rc<WorkerCtx>,
    slots: Rc<ConnectionGuard>,
    conn: Rc<ConnInfo>,
}

impl<W: AsyncWrite + Unpin> Dispatcher<W> {
    async fn run(mut self, stop: &Notify) -> Option<(W, OnUpgrade)> {
        let outcome = self.dispatch().await;
        match outcome {
            Ok(Exit::Upgrade(on_upgrade)) => return Some((self.writer.into_inner(), on_upgrade)),
            Ok(Exit::Close) => self.writer.shutdown().await,
            Err(err) => log::debug!("conn {}: {err}", self.conn.id),
        }

        stop.notify_one();
        None
    }

    async fn dispatch(&mut self) -> Result<Exit> {
        let max = self.ctx.conn_limits.max_pipelined;
        let mut in_flight = InFlight::new();
        let mut open = true;

        loop {
            // Requests that are already parsed are taken without suspending
            while open && in_flight.len() < max {
                let incoming = match self.rx.try_recv() {
                    Ok(incoming) => incoming,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        open = false;
                        break;
                    }
                };

                if let Some(exit) = self.accept(incoming, &mut in_flight).await? {
                    return Ok(exit);
                }
            }

            if in_flight.is_empty() {
                if !open {
                    return Ok(Exit::Close);
                }

                match self.rx.recv().await {
                    Some(incoming) => {
                        if let Some(exit) = self.accept(incoming, &mut in_flight).await? {
                            return Ok(exit);
                        }
                    }
                    None => open = false,
                }
                continue;
            }

            tokio::select! {
                biased;
                Some(dispatched) = in_flight.next() => {
                    if let Some(exit) = self.finish(dispatched).await? {
                        return Ok(exit);
                    }
                }
                incoming = self.rx.recv(), if open && in_flight.len() < max => match incoming {
                    Some(incoming) => {
                        if let Some(exit) = self.accept(incoming, &mut in_flight).await? {
                            return Ok(exit);
                        }
                    }
                    None => open = false,
                },
            }
        }
    }

    /// Invokes the handler. A ready result with nothing queued ahead of it
    /// is written straight away.
    async fn accept(&mut self, incoming: Incoming, in_flight: &mut InFlight) -> Result<Option<Exit>> {
        match self.admit(incoming) {
            Admitted::Ready(dispatched) if in_flight.is_empty() => self.finish(dispatched).await,
            Admitted::Ready(dispatched) => {
                in_flight.push_back(future::ready(dispatched).boxed_local());
                Ok(None)
            }
            Admitted::Pending(pending) => {
                in_flight.push_back(pending);
                Ok(None)
            }
        }
    }

    fn admit(&self, incoming: Incoming) -> Admitted {
        let (token, gate) = match incoming {
            Incoming::Request { token, gate } => (token, gate),
            Incoming::Exhausted(version) => return Admitted::Ready(Dispatched::Exhausted(version)),
        };

        let request = match Request::new(token, self.ctx.slab.clone(), self.conn.clone()) {
            Ok(request) => request,
            Err(err) => return Admitted::Ready(Dispatched::Broken(err)),
        };
        let exchange = Exchange {
            version: request.version(),
            method: request.method(),
            keep_alive: request.is_keep_alive(),
        };

        match self.ctx.callback.call(request) {
            Reply::Ready(result) => Admitted::Ready(Dispatched::Reply {
                token,
                exchange,
                gate,
                result,
            }),
            Reply::Pending(pending) => Admitted::Pending(
                pending
                    .map(move |result| Dispatched::Reply {
                        token,
                        exchange,
                        gate,
                        result,
                    })
                    .boxed_local(),
            ),
        }
    }

    /// Writes the response for the request at the head of the queue and
    /// recycles its slot.
    async fn finish(&mut self, dispatched: Dispatched) -> Result<Option<Exit>> {
        let (token, exchange, gate, result) = match dispatched {
            Dispatched::Reply {
                token,
                exchange,
                gate,
                result,
            } => (token, exchange, gate, result),
            Dispatched::Exhausted(version) => {
                if let Some(canned) = ErrorKind::ServiceUnavailable.as_http(version, self.ctx.json_errors) {
                    self.writer.send_raw(canned).await?;
                }
                return Ok(Some(Exit::Close));
            }
            Dispatched::Broken(err) => return Err(err),
        };

        let response = match result {
            Ok(response) if response.is_upgrade() && gate.is_none() => {
                self.recover(token, "upgrade response to a request that did not ask for one".into())
            }
            Ok(response) => Some(response),
            Err(err) => self.recover(token, err),
        };

        let exchange = self.settle(token, exchange);
        let written = match response {
            Some(response) => self.writer.write(exchange, response).await,
            None => Ok(Written::Close),
        };
        self.retire(token);

        match written? {
            Written::KeepAlive => {
                if let Some(gate) = gate {
                    let _ = gate.send(true);
                }
                Ok(None)
            }
            Written::Close => Ok(Some(Exit::Close)),
            Written::Upgrade(on_upgrade) => match gate.map(|gate| gate.send(false)) {
                Some(Ok(())) => Ok(Some(Exit::Upgrade(on_upgrade))),
                _ => Ok(Some(Exit::Close)),
            },
        }
    }

    /// A response that is ready while its request body is still arriving,
    /// and nobody took that body, ends the connection instead of waiting for
    /// the rest of the upload.
    fn settle(&self, token: Token, mut exchange: Exchange) -> Exchange {
        if let Ok(slot) = self.ctx.slab.borrow().get(token) {
            if slot.state == ParseState::BodyInProgress && !matches!(slot.body, BodySource::Taken) {
                log::trace!("conn {}: {token} answered before its body arrived", self.conn.id);
                exchange.keep_alive = false;
            }
        }
        exchange
    }

    /// Turns a handler failure into a response. `None` closes the connection.
    fn recover(&self, token: Token, err: HandlerError) -> Option<Response> {
        let Some(on_error) = &self.ctx.on_error else {
            log::warn!("conn {}: {token}: {}", self.conn.id, Error::Handler(err));
            return Some(self.internal_error());
        };
        log::warn!("conn {}: {token}: handler failed: {err}", self.conn.id);

        match on_error(err) {
            Ok(response) if response.is_upgrade() => {
                log::warn!("conn {}: on_error cannot upgrade a connection", self.conn.id);
                None
            }
            Ok(response) => Some(response),
            Err(err) => {
                log::warn!("conn {}: on_error: {}", self.conn.id, Error::Handler(err));
                None
            }
        }
    }

    fn internal_error(&self) -> Response {
        let response = Response::new(StatusCode::InternalServerError);

        match self.ctx.json_errors {
            true => response
                .header("Content-Type", "application/json")
                .body(INTERNAL_ERROR_JSON),
            false => response,
        }
    }

    fn retire(&self, token: Token) {
        if let Ok(slot) = self.ctx.slab.borrow_mut().get_mut(token) {
            slot.written = true;
        }
        if let Err(err) = self.slots.recycle(token) {
            log::debug!("conn {}: {err}", self.conn.id);
        }
    }
}
