use crate::{
    errors::Result,
    http::{
        parser::{BodyFraming, Parser},
        types::{Method, Version},
    },
    server::{
        slab::{BodySource, ParseState, RequestSlab, RequestSlot, Token},
        transport::{RemoteAddr, TransportKind},
    },
};
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use std::{
    cell::RefCell,
    fmt, io,
    net::SocketAddr,
    pin::Pin,
    rc::Rc,
    str,
    task::{Context, Poll},
};
use tokio::sync::mpsc;

/// What the driver knows about the connection a request arrived on.
#[derive(Debug)]
pub(crate) struct ConnInfo {
    pub(crate) id: u64,
    pub(crate) remote: RemoteAddr,
    pub(crate) local: SocketAddr,
}

/// Handle to an in-flight request.
///
/// Holds no request data itself: the head and body live in the worker's
/// request slab and are looked up through the request's [`Token`]. Cloning
/// is cheap.
///
/// Slab-backed accessors return [`Error::InvalidToken`](crate::Error::InvalidToken)
/// once the response for this request has been written and its slot reused,
/// which only happens if a handle is kept past the end of its handler.
///
/// # Input requirements
///
/// The whole head (request line and headers) must be UTF-8 and every line
/// must end with exactly `\r\n`. Anything else closes the connection without
/// a response.
///
/// ```text
/// [METHOD] SP [TARGET] SP "HTTP/1." ("0" / "1") CRLF
/// *([NAME] ":" OWS [VALUE] OWS CRLF)
/// CRLF
/// ```
#[derive(Clone)]
pub struct Request {
    token: Token,
    slab: Rc<RefCell<RequestSlab>>,
    conn: Rc<ConnInfo>,

    method: Method,
    version: Version,
    has_body: bool,
    keep_alive: bool,
}

impl Request {
    pub(crate) fn new(
        token: Token,
        slab: Rc<RefCell<RequestSlab>>,
        conn: Rc<ConnInfo>,
    ) -> Result<Self> {
        let (method, version, has_body, keep_alive) = {
            let slab = slab.borrow();
            let slot = slab.get(token)?;
            (slot.method, slot.version, slot.has_body, slot.keep_alive)
        };

        Ok(Self {
            token,
            slab,
            conn,
            method,
            version,
            has_body,
            keep_alive,
        })
    }

    #[inline]
    fn with_slot<T>(&self, f: impl FnOnce(&RequestSlot) -> T) -> Result<T> {
        let slab = self.slab.borrow();
        Ok(f(slab.get(self.token)?))
    }
}

impl Request {
    #[inline(always)]
    pub fn token(&self) -> Token {
        self.token
    }

    #[inline(always)]
    pub fn method(&self) -> Method {
        self.method
    }

    #[inline(always)]
    pub fn version(&self) -> Version {
        self.version
    }

    #[inline(always)]
    pub fn remote_addr(&self) -> RemoteAddr {
        self.conn.remote
    }

    #[inline(always)]
    pub fn local_addr(&self) -> SocketAddr {
        self.conn.local
    }

    /// `false` for `GET` and `HEAD`, and for requests without a body.
    #[inline(always)]
    pub fn has_body(&self) -> bool {
        self.has_body
    }

    /// Whether the client asked to keep the connection open.
    #[inline(always)]
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Request target exactly as sent (`/path?query`, or absolute form).
    pub fn target(&self) -> Result<Bytes> {
        self.with_slot(|slot| slot.head_slice(&slot.target))
    }

    /// Full URL of the request.
    ///
    /// The scheme comes from the transport, the authority from the `Host`
    /// header or, without one, from the local address. Absolute-form targets
    /// are returned unchanged.
    ///
    /// ```text
    /// GET /a?b=1 HTTP/1.1 + Host: example.com  ->  http://example.com/a?b=1
    /// GET /a HTTP/1.0 (no Host, TLS)           ->  https://127.0.0.1:9000/a
    /// ```
    pub fn url(&self) -> Result<String> {
        let target = self.target()?;
        let target = str::from_utf8(&target).unwrap_or_default();

        if target.starts_with("http://") || target.starts_with("https://") {
            return Ok(target.to_string());
        }

        let scheme = match self.conn.remote.transport {
            TransportKind::Tcp => "http",
            TransportKind::Tls => "https",
        };

        let url = match self.header("host")? {
            Some(host) if !host.is_empty() => {
                format!("{scheme}://{}{target}", String::from_utf8_lossy(&host))
            }
            _ => format!("{scheme}://{}{target}", self.conn.local),
        };

        Ok(url)
    }

    /// First value of the header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Result<Option<Bytes>> {
        self.with_slot(|slot| {
            slot.headers
                .iter()
                .find(|(n, _)| slot.head[n.clone()].eq_ignore_ascii_case(name.as_bytes()))
                .map(|(_, v)| slot.head_slice(v))
        })
    }

    /// All headers in the order they were received. Repeated names are kept.
    pub fn headers(&self) -> Result<Vec<(Bytes, Bytes)>> {
        self.with_slot(|slot| {
            slot.headers
                .iter()
                .map(|(n, v)| (slot.head_slice(n), slot.head_slice(v)))
                .collect()
        })
    }

    /// Takes the request body.
    ///
    /// Returns `None` when the request has no body, which is always the case
    /// for `GET` and `HEAD`. The body can be taken once; later calls return
    /// an already exhausted body.
    pub fn body(&self) -> Result<Option<RequestBody>> {
        if !self.has_body {
            return Ok(None);
        }

        let mut slab = self.slab.borrow_mut();
        let body = match slab.get_mut(self.token)?.take_body() {
            BodySource::Buffered(bytes) => RequestBody::Full(Some(bytes)),
            BodySource::Streaming(rx) => RequestBody::Streaming(rx),
            BodySource::None | BodySource::Taken => RequestBody::Empty,
        };

        Ok(Some(body))
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("token", &self.token)
            .field("method", &self.method)
            .field("version", &self.version)
            .field("remote", &self.conn.remote)
            .field("has_body", &self.has_body)
            .finish()
    }
}

/// Pull-based request body.
///
/// Yields the body in the order it arrived. A body framed by
/// `Content-Length: N` yields exactly `N` bytes in total; a connection that
/// breaks first ends the stream with an error.
pub enum RequestBody {
    Empty,
    Full(Option<Bytes>),
    Streaming(mpsc::Receiver<io::Result<Bytes>>),
}

impl RequestBody {
    /// Collects the remaining body into one buffer.
    pub async fn bytes(mut self) -> io::Result<Bytes> {
        if let RequestBody::Full(bytes) = &mut self {
            return Ok(bytes.take().unwrap_or_default());
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = self.next().await {
            body.extend_from_slice(&chunk?);
        }

        Ok(body.freeze())
    }
}

impl Stream for RequestBody {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut() {
            RequestBody::Empty => Poll::Ready(None),
            RequestBody::Full(bytes) => Poll::Ready(bytes.take().map(Ok)),
            RequestBody::Streaming(rx) => rx.poll_recv(cx),
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Full(bytes) => f.debug_tuple("Full").field(bytes).finish(),
            RequestBody::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}

impl RequestSlot {
    /// Records a completed head. Ranges reported by `parser` index into `head`.
    pub(crate) fn set_head(&mut self, head: Bytes, parser: &Parser, framing: BodyFraming) {
        self.head = head;
        self.headers.extend_from_slice(parser.headers());

        self.keep_alive = parser.keep_alive();
        self.upgrade = parser.upgrade();
        self.has_body = self.method.allows_body() && framing != BodyFraming::None;
        self.state = ParseState::HeadersParsed;
    }
}

#[cfg(test)]
mod request_tests {
    use super::*;
    use crate::{http::parser::ParseEvent, limits::{ReqLimits, SlabPolicy}, tools::*};
    use std::net::{IpAddr, Ipv4Addr};

    fn conn(transport: TransportKind) -> Rc<ConnInfo> {
        Rc::new(ConnInfo {
            id: 1,
            remote: RemoteAddr::new(transport, "10.0.0.7:51000".parse().unwrap()),
            local: "127.0.0.1:9000".parse().unwrap(),
        })
    }

    /// Parses `src` into a fresh slot the way the connection reader does.
    fn request(src: &str, transport: TransportKind) -> (Request, Rc<RefCell<RequestSlab>>) {
        let slab = Rc::new(RefCell::new(RequestSlab::new(SlabPolicy::Fixed(4))));
        let mut parser = Parser::new(&ReqLimits::default());
        let token = slab.borrow_mut().allocate(1).unwrap();

        loop {
            match parser.feed(src.as_bytes()).unwrap() {
                ParseEvent::RequestLine { method, target, version } => {
                    let mut slab = slab.borrow_mut();
                    let slot = slab.get_mut(token).unwrap();
                    (slot.method, slot.target, slot.version) = (method, target, version);
                }
                ParseEvent::HeaderComplete { head_len, framing } => {
                    let head = Bytes::copy_from_slice(&src.as_bytes()[..head_len]);
                    let body = Bytes::copy_from_slice(&src.as_bytes()[head_len..]);

                    let mut slab = slab.borrow_mut();
                    let slot = slab.get_mut(token).unwrap();
                    slot.set_head(head, &parser, framing);
                    if slot.has_body {
                        slot.body = BodySource::Buffered(body);
                    }
                    break;
                }
                ParseEvent::NeedMoreData => panic!("incomplete head"),
            }
        }

        let request = Request::new(token, slab.clone(), conn(transport)).unwrap();
        (request, slab)
    }

    #[test]
    fn accessors() {
        let (req, _slab) = request(
            "GET /items?id=4 HTTP/1.1\r\nHost: example.com\r\nX-Tag: a\r\nx-tag: b\r\n\r\n",
            TransportKind::Tcp,
        );

        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.version(), Version::Http11);
        assert!(req.is_keep_alive());
        assert_eq!(str_op(&req.target().unwrap()), "/items?id=4");
        assert_eq!(req.url().unwrap(), "http://example.com/items?id=4");

        assert_eq!(req.header("x-TAG").unwrap().as_deref(), Some(&b"a"[..]));
        assert_eq!(req.header("missing").unwrap(), None);

        let headers = req.headers().unwrap();
        let headers: Vec<_> = headers.iter().map(|(n, v)| str_2((&n[..], &v[..]))).collect();
        assert_eq!(headers, [("Host", "example.com"), ("X-Tag", "a"), ("x-tag", "b")]);

        assert_eq!(
            req.remote_addr(),
            RemoteAddr {
                transport: TransportKind::Tcp,
                ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)),
                port: 51000
            }
        );
    }

    #[test]
    fn url_forms() {
        #[rustfmt::skip]
        let cases = [
            ("GET /a HTTP/1.0\r\n\r\n",                          TransportKind::Tcp, "http://127.0.0.1:9000/a"),
            ("GET /a HTTP/1.1\r\nHost: x:81\r\n\r\n",            TransportKind::Tls, "https://x:81/a"),
            ("GET http://other/b HTTP/1.1\r\nHost: x\r\n\r\n",   TransportKind::Tcp, "http://other/b"),
        ];

        for (src, transport, expected) in cases {
            let (req, _slab) = request(src, transport);
            assert_eq!(req.url().unwrap(), expected, "{src:?}");
        }
    }

    #[tokio::test]
    async fn get_and_head_never_expose_a_body() {
        for method in ["GET", "HEAD"] {
            let src = format!("{method} / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");
            let (req, _slab) = request(&src, TransportKind::Tcp);

            assert!(!req.has_body());
            assert!(req.body().unwrap().is_none(), "{method}");
        }
    }

    #[tokio::test]
    async fn body_is_consumed_once() {
        let (req, _slab) = request(
            "POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello",
            TransportKind::Tcp,
        );
        assert!(req.has_body());

        let body = req.body().unwrap().unwrap().bytes().await.unwrap();
        assert_eq!(body, "hello");

        let again = req.body().unwrap().unwrap().bytes().await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn streaming_body_in_order() {
        let (tx, rx) = mpsc::channel(4);
        let mut body = RequestBody::Streaming(rx);

        for chunk in ["ab", "cd", "e"] {
            tx.send(Ok(Bytes::from_static(chunk.as_bytes()))).await.unwrap();
        }
        drop(tx);

        assert_eq!(body.next().await.unwrap().unwrap(), "ab");
        assert_eq!(body.bytes().await.unwrap(), "cde");
    }

    #[test]
    fn stale_handle_is_rejected() {
        let (req, slab) = request("GET / HTTP/1.1\r\n\r\n", TransportKind::Tcp);
        {
            let mut slab = slab.borrow_mut();
            slab.get_mut(req.token()).unwrap().written = true;
            slab.recycle(req.token()).unwrap();
        }

        assert!(matches!(req.target(), Err(crate::Error::InvalidToken(_))));
        assert!(req.header("host").is_err());
    }
}
