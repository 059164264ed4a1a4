//! Response descriptions returned by handlers.
//!
//! A [`Response`] only describes what should be sent: status, ordered
//! headers and a [`Body`]. Turning it into wire bytes (status line, `Date`,
//! `Content-Length` or chunked framing, connection management) is the job of
//! the connection's writer, which runs once the response reaches the front of
//! the connection's queue.

use crate::{
    errors::HandlerError,
    http::types::StatusCode,
    server::callback::{OnUpgrade, Upgraded},
    BodyWriter, WriteBuffer,
};
use bytes::Bytes;
use futures_util::stream::{LocalBoxStream, Stream};
use std::{borrow::Cow, fmt, future::Future, io, rc::Rc, sync::Arc};

/// Response body.
///
/// The variant is chosen once, when the handler builds the response; the
/// writer never inspects the payload to decide how to frame it.
pub enum Body {
    /// No payload. `Content-Length: 0` is still sent.
    Empty,
    /// UTF-8 text, sent as is.
    Text(Cow<'static, str>),
    /// Raw bytes, sent as is.
    Bytes(Bytes),
    /// Pull-based producer. Sent with chunked framing to HTTP/1.1 clients;
    /// HTTP/1.0 clients get the raw bytes and the connection is closed.
    Stream(LocalBoxStream<'static, io::Result<Bytes>>),
}

impl Body {
    /// Wraps a chunk producer.
    #[inline]
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + 'static,
    {
        Body::Stream(Box::pin(stream))
    }

    /// Payload size, if known up front.
    #[inline]
    pub fn len(&self) -> Option<usize> {
        match self {
            Body::Empty => Some(0),
            Body::Text(text) => Some(text.len()),
            Body::Bytes(bytes) => Some(bytes.len()),
            Body::Stream(_) => None,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    #[inline(always)]
    pub(crate) fn as_bytes(&self) -> &[u8] {
        match self {
            Body::Empty | Body::Stream(_) => &[],
            Body::Text(text) => text.as_bytes(),
            Body::Bytes(bytes) => bytes,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Body::Bytes(bytes) => f.debug_tuple("Bytes").field(bytes).finish(),
            Body::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

macro_rules! impl_body_from {
    ($($t:ty => |$v:ident| $conv:expr),* $(,)?) => {
        $(
            impl From<$t> for Body {
                #[inline]
                fn from($v: $t) -> Self {
                    $conv
                }
            }

            impl From<$t> for Response {
                #[inline]
                fn from($v: $t) -> Self {
                    Response::new(StatusCode::Ok).body($v)
                }
            }
        )*
    };
}

impl_body_from! {
    &'static str => |v| Body::Text(Cow::Borrowed(v)),
    String => |v| Body::Text(Cow::Owned(v)),
    Cow<'static, str> => |v| Body::Text(v),
    &'static [u8] => |v| Body::Bytes(Bytes::from_static(v)),
    Vec<u8> => |v| Body::Bytes(Bytes::from(v)),
    Bytes => |v| Body::Bytes(v),
}

/// HTTP response description.
///
/// # Examples
/// ```
/// use flashline::{Response, StatusCode};
///
/// // 200 with a literal body and no implicit headers
/// let plain: Response = "Hello World".into();
///
/// // Status, headers in insertion order, then the body
/// let created = Response::new(StatusCode::Created)
///     .header("Content-Type", "application/json")
///     .header("X-Request-Id", 42)
///     .body(r#"{"id":42}"#);
///
/// // Combined fast path: `Content-Type: text/plain;charset=utf-8` is implied
/// let text = Response::text("pong");
/// ```
pub struct Response {
    pub(crate) status: StatusCode,
    /// Serialized `name: value\r\n` lines, in insertion order.
    pub(crate) headers: Vec<u8>,
    pub(crate) body: Body,
    pub(crate) plain_text: bool,
    pub(crate) close: bool,
    pub(crate) on_upgrade: Option<OnUpgrade>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &String::from_utf8_lossy(&self.headers))
            .field("body", &self.body)
            .field("close", &self.close)
            .field("upgrade", &self.on_upgrade.is_some())
            .finish()
    }
}

impl Response {
    /// Creates an empty response with the given status.
    #[inline]
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Body::Empty,
            plain_text: false,
            close: false,
            on_upgrade: None,
        }
    }

    /// `200 OK` with a UTF-8 text body and
    /// `Content-Type: text/plain;charset=utf-8`.
    ///
    /// The status line, content type, length and body are serialized into a
    /// single buffer and offered to the socket in one write.
    #[inline]
    pub fn text<T: Into<Cow<'static, str>>>(body: T) -> Self {
        Self {
            body: Body::Text(body.into()),
            plain_text: true,
            ..Self::new(StatusCode::Ok)
        }
    }

    /// `101 Switching Protocols`. Once the response head is written, the
    /// connection stops speaking HTTP and is handed to `on_upgrade`.
    ///
    /// Only valid for requests carrying `Connection: upgrade` and an
    /// `Upgrade` header; for any other request the handler is treated as
    /// having failed.
    ///
    /// ```no_run
    /// use flashline::{Response, Upgraded};
    /// use tokio::io::{copy, split};
    ///
    /// let response = Response::upgrade(|io: Upgraded| async move {
    ///     let (mut rd, mut wr) = split(io);
    ///     copy(&mut rd, &mut wr).await?;
    ///     Ok::<_, flashline::HandlerError>(())
    /// })
    /// .header("Upgrade", "echo")
    /// .header("Connection", "upgrade");
    /// ```
    pub fn upgrade<F, Fut>(on_upgrade: F) -> Self
    where
        F: FnOnce(Upgraded) -> Fut + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + 'static,
    {
        Self {
            on_upgrade: Some(Box::new(move |io| Box::pin(on_upgrade(io)))),
            ..Self::new(StatusCode::SwitchingProtocols)
        }
    }

    #[inline]
    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Appends a header. Headers are written in the order they were added;
    /// repeated names are kept.
    ///
    /// PLEASE DO NOT ADD THE FOLLOWING HEADERS:
    /// - `Content-Length` / `Transfer-Encoding` - derived from the body
    /// - `Connection` - use [`close()`](Response::close)
    /// - `Date` - added by the server
    ///
    /// A header whose name or value contains `\r` or `\n` is dropped.
    #[inline]
    pub fn header<N: WriteBuffer, V: WriteBuffer>(mut self, name: N, value: V) -> Self {
        let start = self.headers.len();

        name.write_to(&mut self.headers);
        self.headers.extend_from_slice(b": ");
        value.write_to(&mut self.headers);

        if memchr::memchr2(b'\r', b'\n', &self.headers[start..]).is_some() {
            log::warn!("dropping response header with CR or LF");
            self.headers.truncate(start);
            return self;
        }

        self.headers.extend_from_slice(b"\r\n");
        self
    }

    #[inline]
    pub fn body<B: Into<Body>>(mut self, body: B) -> Self {
        self.body = body.into();
        self
    }

    /// Builds a byte body through a closure.
    ///
    /// ```
    /// use flashline::{Response, StatusCode};
    /// use std::io::Write;
    ///
    /// let response = Response::new(StatusCode::Ok).body_with(|w| {
    ///     w.write("count: ");
    ///     w.write(42);
    ///     let _ = write!(w, ", ok: {}", true);
    /// });
    /// ```
    #[inline]
    pub fn body_with<F: FnOnce(&mut BodyWriter)>(mut self, f: F) -> Self {
        let mut buffer = Vec::new();
        f(&mut BodyWriter(&mut buffer));

        self.body = Body::Bytes(Bytes::from(buffer));
        self
    }

    /// Streams the body from a chunk producer.
    #[inline]
    pub fn stream<S>(mut self, stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + 'static,
    {
        self.body = Body::stream(stream);
        self
    }

    /// Forces the connection to close after this response.
    #[inline]
    pub fn close(mut self) -> Self {
        self.close = true;
        self
    }
}

impl Response {
    #[inline]
    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    /// Iterates over the headers added so far, in insertion order.
    pub fn headers(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.headers
            .split(|b| *b == b'\n')
            .filter_map(|line| line.strip_suffix(b"\r"))
            .filter_map(|line| {
                let colon = memchr::memchr(b':', line)?;
                Some((&line[..colon], line[colon + 1..].trim_ascii_start()))
            })
    }

    #[inline]
    pub fn body_ref(&self) -> &Body {
        &self.body
    }

    #[inline]
    pub fn is_upgrade(&self) -> bool {
        self.on_upgrade.is_some()
    }
}

pub(crate) const fn number_to_bytes(mut n: u128) -> ([u8; 39], usize) {
    let mut buffer = [b'0'; 39];
    let mut i = 39;

    if n == 0 {
        return (buffer, 38);
    }

    while n > 0 {
        i -= 1;
        buffer[i] = b'0' + (n % 10) as u8;
        n /= 10;
    }

    (buffer, i)
}

pub mod write {
    use super::*;

    /// Writer for constructing a response body.
    /// Used in [body_with](Response::body_with).
    ///
    /// Accepts anything implementing [`WriteBuffer`] and also implements
    /// [`std::io::Write`], so `write!` works too.
    #[derive(Debug)]
    pub struct BodyWriter<'a>(pub(crate) &'a mut Vec<u8>);

    impl BodyWriter<'_> {
        /// Appends content to the response body.
        #[inline]
        pub fn write<T: WriteBuffer>(&mut self, value: T) {
            value.write_to(self.0);
        }
    }

    impl std::io::Write for BodyWriter<'_> {
        #[inline]
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }

        #[inline]
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Trait for writing header names, header values and body pieces
    /// straight into a byte buffer.
    ///
    /// Implemented for common types like strings, bytes, booleans
    /// and integer types.
    ///
    /// # Note on Floating-Point
    /// Floating-point numbers are not implemented to avoid locale-dependent
    /// formatting and precision issues in protocol headers.
    ///
    /// # Example
    /// ```
    /// use flashline::WriteBuffer;
    ///
    /// struct RequestId(u64);
    ///
    /// impl WriteBuffer for RequestId {
    ///     fn write_to(&self, buffer: &mut Vec<u8>) {
    ///         buffer.extend_from_slice(b"req-");
    ///         self.0.write_to(buffer);
    ///     }
    /// }
    /// ```
    pub trait WriteBuffer {
        /// Writes the value's representation directly to the buffer.
        fn write_to(&self, buffer: &mut Vec<u8>);
    }

    macro_rules! impl_write_buffer {
        (bytes, $conv:expr => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    let closure = $conv;
                    closure(self, buffer);
                }
            })*
        };
        (number($type:ty), $conv:expr => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    $conv(*self as $type, buffer);
                }
            })*
        };
    }

    impl<T: WriteBuffer + ?Sized> WriteBuffer for &T {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            T::write_to(*self, buffer);
        }
    }
    impl WriteBuffer for str {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self.as_bytes());
        }
    }
    impl WriteBuffer for [u8] {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self);
        }
    }
    impl_write_buffer! {
        bytes, |value: &str, buffer: &mut Vec<u8>| {
            buffer.extend_from_slice(value.as_bytes());
        } => String, Box<str>, Cow<'_, str>, Arc<str>, Rc<str>
    }
    impl_write_buffer! {
        bytes, |value: &[u8], buffer: &mut Vec<u8>| {
            buffer.extend_from_slice(value);
        } => Vec<u8>, Box<[u8]>, Cow<'_, [u8]>, Arc<[u8]>, Rc<[u8]>, Bytes
    }
    impl<const N: usize> WriteBuffer for [u8; N] {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self);
        }
    }
    impl_write_buffer! {
        number(u128), write_u128 => u8, u16, u32, u64, u128, usize
    }
    impl_write_buffer! {
        number(i128), write_i128 => i8, i16, i32, i64, i128, isize
    }
    impl WriteBuffer for bool {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(match self {
                true => b"true",
                false => b"false",
            });
        }
    }
    impl WriteBuffer for StatusCode {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            write_u128(self.as_u16() as u128, buffer);
        }
    }

    #[inline(always)]
    pub(crate) fn write_u128(value: u128, buffer: &mut Vec<u8>) {
        let (arr, start) = number_to_bytes(value);
        buffer.extend_from_slice(&arr[start..]);
    }

    #[inline(always)]
    fn write_i128(value: i128, buffer: &mut Vec<u8>) {
        if value < 0 {
            buffer.push(b'-');
        }
        write_u128(value.unsigned_abs(), buffer);
    }
}

#[cfg(test)]
mod response_tests {
    use super::*;
    use crate::tools::*;

    #[test]
    fn headers_keep_insertion_order() {
        let resp = Response::new(StatusCode::Ok)
            .header("Content-Type", "text/plain")
            .header("X-Count", 3u8)
            .header("Set-Cookie", "a=1")
            .header(b"Set-Cookie", String::from("b=2"))
            .header("X-Neg", -12i64)
            .header("X-Flag", false);

        let headers: Vec<_> = resp.headers().map(str_2).collect();
        assert_eq!(
            headers,
            [
                ("Content-Type", "text/plain"),
                ("X-Count", "3"),
                ("Set-Cookie", "a=1"),
                ("Set-Cookie", "b=2"),
                ("X-Neg", "-12"),
                ("X-Flag", "false"),
            ]
        );
        assert_eq!(
            str_op(&resp.headers),
            "Content-Type: text/plain\r\nX-Count: 3\r\nSet-Cookie: a=1\r\n\
             Set-Cookie: b=2\r\nX-Neg: -12\r\nX-Flag: false\r\n"
        );
    }

    #[test]
    fn header_with_line_break_is_dropped() {
        #[rustfmt::skip]
        let cases: [(&str, &str); 4] = [
            ("X-A",         "b\r\nX-Evil: 1"),
            ("X-A",         "b\nX-Evil: 1"),
            ("X-A\r\nX-B", "c"),
            ("X-A",         "trailing\r"),
        ];

        for (name, value) in cases {
            let resp = Response::new(StatusCode::Ok)
                .header("X-Before", 1u8)
                .header(name, value)
                .header("X-After", 2u8);

            let headers: Vec<_> = resp.headers().map(str_2).collect();
            assert_eq!(headers, [("X-Before", "1"), ("X-After", "2")], "{name:?}: {value:?}");
        }
    }

    #[test]
    fn body_variants() {
        #[rustfmt::skip]
        let cases: [(Response, Option<usize>, &[u8]); 6] = [
            ("hi".into(),                                  Some(2), b"hi"),
            (String::from("hello").into(),                 Some(5), b"hello"),
            (b"\x00\x01".as_slice().into(),                Some(2), b"\x00\x01"),
            (vec![1u8, 2, 3].into(),                       Some(3), b"\x01\x02\x03"),
            (Response::new(StatusCode::NoContent),         Some(0), b""),
            (Response::new(StatusCode::Ok).stream(futures_util::stream::empty()), None, b""),
        ];

        for (resp, len, bytes) in cases {
            assert_eq!(resp.body_ref().len(), len, "{resp:?}");
            assert_eq!(resp.body_ref().as_bytes(), bytes, "{resp:?}");
        }
    }

    #[test]
    fn text_and_literal_differ_only_in_content_type() {
        let text = Response::text("pong");
        let literal: Response = "pong".into();

        assert!(text.plain_text);
        assert!(!literal.plain_text);
        assert_eq!(text.body_ref().as_bytes(), literal.body_ref().as_bytes());
        assert_eq!(text.status_code(), StatusCode::Ok);
    }

    #[test]
    fn body_with_writer() {
        use std::io::Write;

        let resp = Response::new(StatusCode::Ok).body_with(|w| {
            w.write("n=");
            w.write(1234567890u64);
            w.write(b";");
            write!(w, "{}", 'x').unwrap();
        });

        assert_eq!(resp.body_ref().as_bytes(), b"n=1234567890;x");
    }

    #[test]
    fn numbers() {
        #[rustfmt::skip]
        let cases = [
            (0u128,       "0"),
            (7,           "7"),
            (10,          "10"),
            (u64::MAX as u128, "18446744073709551615"),
        ];

        for (n, expected) in cases {
            let mut buffer = Vec::new();
            write::write_u128(n, &mut buffer);
            assert_eq!(str_op(&buffer), expected);
        }
    }

    #[test]
    fn upgrade_and_close_flags() {
        let resp = Response::upgrade(|_io| async { Ok(()) });
        assert!(resp.is_upgrade());
        assert_eq!(resp.status_code(), StatusCode::SwitchingProtocols);

        let resp = Response::text("bye").close();
        assert!(resp.close && !resp.is_upgrade());
    }
}
