use crate::{server::slab::Token, Version};
use std::{error, fmt, io};
use thiserror::Error;

/// Error type returned by a request handler.
///
/// Anything convertible into a boxed error can be returned with `?` from a
/// handler; the server turns it into a response through
/// [`on_error`](crate::ServerBuilder::on_error).
pub type HandlerError = Box<dyn error::Error + Send + Sync>;

/// Result alias for the public API of this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the server core.
///
/// No variant is retried automatically: retry policy belongs to the
/// application above this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Unparseable request line or headers, or conflicting body framing.
    /// The connection is closed without a response.
    #[error("malformed request: {0}")]
    MalformedRequest(&'static str),

    /// The request slab is full under [`SlabPolicy::Fixed`](crate::limits::SlabPolicy::Fixed).
    #[error("request slab exhausted ({capacity} slots in use)")]
    ResourceExhausted { capacity: usize },

    /// The token does not name a live slot (already recycled or never issued).
    #[error("token {0} does not refer to a live request")]
    InvalidToken(Token),

    /// `recycle` was called before the response for the token was written.
    #[error("response for token {0} has not been written yet")]
    ResponsePending(Token),

    /// The handler returned an error.
    #[error("handler failed: {0}")]
    Handler(HandlerError),

    /// The peer went away mid-read or mid-write.
    #[error("transport closed by peer")]
    TransportClosed,

    /// A streamed response body failed while being pumped.
    #[error("response body producer failed: {0}")]
    StreamProducer(io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("invalid configuration: {0}")]
    Config(&'static str),
}

impl Error {
    #[inline]
    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => Error::TransportClosed,
            _ => Error::Io(err),
        }
    }
}

/// Body of the default `500` response when JSON errors are enabled.
pub(crate) const INTERNAL_ERROR_JSON: &str =
    r#"{"error":"Internal server error","code":"INTERNAL_ERROR"}"#;

/// Request-level failures detected while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorKind {
    InvalidMethod,
    InvalidUrl,
    InvalidVersion,
    UnsupportedVersion,

    InvalidHeader,
    InvalidEncoding,
    TooManyHeaders,
    HeadTooLarge,

    InvalidContentLength,
    ConflictingFraming,
    UnsupportedTransferEncoding,
    InvalidChunk,
    BodyTooLarge,

    ServiceUnavailable,
}

macro_rules! canned_responses {
    ($($name:ident: $status_code:literal, $len:literal => $json:literal; )*) => {
        /// Ready-made responses for the errors the core answers on its own.
        /// Every other kind closes the connection without a reply.
        pub(crate) const fn as_http(&self, version: Version, json: bool) -> Option<&'static [u8]> {
            let value = match (json, self, version) { $(
                (true, Self::$name, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "Connection: close\r\n",
                    "Content-Length: ", $len, "\r\n",
                    "Content-Type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "Connection: close\r\n",
                    "Content-Length: 0\r\n\r\n",
                ),
                (true, Self::$name, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "Connection: close\r\n",
                    "Content-Length: ", $len, "\r\n",
                    "Content-Type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "Connection: close\r\n",
                    "Content-Length: 0\r\n\r\n",
                ),
            )*
                _ => return None,
            };

            Some(value.as_bytes())
        }
    };
}

impl ErrorKind {
    canned_responses! {
        ServiceUnavailable: "503 Service Unavailable", "72"
            => r#"{"error":"Service temporarily unavailable","code":"SERVICE_UNAVAILABLE"}"#;
    }

    #[inline]
    pub(crate) const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidMethod => "invalid method",
            Self::InvalidUrl => "invalid request target",
            Self::InvalidVersion => "invalid HTTP version",
            Self::UnsupportedVersion => "unsupported HTTP version",
            Self::InvalidHeader => "invalid header line",
            Self::InvalidEncoding => "request head is not valid UTF-8",
            Self::TooManyHeaders => "too many headers",
            Self::HeadTooLarge => "request head too large",
            Self::InvalidContentLength => "invalid Content-Length",
            Self::ConflictingFraming => "conflicting body framing headers",
            Self::UnsupportedTransferEncoding => "unsupported Transfer-Encoding",
            Self::InvalidChunk => "invalid chunked body",
            Self::BodyTooLarge => "request body too large",
            Self::ServiceUnavailable => "service unavailable",
        }
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::MalformedRequest(kind.as_str())
    }
}
