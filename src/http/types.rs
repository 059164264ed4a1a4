//! Method, version and status types shared by the parser and the writer

use crate::errors::ErrorKind;

#[inline(always)]
pub(crate) fn slice_to_u64(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() {
        return None;
    }

    let mut result: u64 = 0;
    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }

        result = result.checked_mul(10)?.checked_add((byte - b'0') as u64)?;
    }

    Some(result)
}

/// Iterates over the comma-separated tokens of a header value,
/// trimming optional whitespace around each one.
#[inline]
pub(crate) fn header_tokens(value: &[u8]) -> impl Iterator<Item = &[u8]> {
    value
        .split(|b| *b == b',')
        .map(|token| token.trim_ascii())
        .filter(|token| !token.is_empty())
}

// METHOD

/// Request method.
///
/// Only `GET` and `HEAD` are treated as bodyless: a body sent with them is
/// read off the wire and dropped. `TRACE` and `CONNECT` are rejected as
/// malformed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
    Put,
    Post,
    /// Answered with headers only
    Head,
    Patch,
    Delete,
    Options,
}

impl Method {
    #[inline(always)]
    pub(crate) fn from_bytes(src: &[u8]) -> Result<Self, ErrorKind> {
        match src {
            b"GET" => Ok(Method::Get),
            b"PUT" => Ok(Method::Put),
            b"POST" => Ok(Method::Post),
            b"HEAD" => Ok(Method::Head),
            b"PATCH" => Ok(Method::Patch),
            b"DELETE" => Ok(Method::Delete),
            b"OPTIONS" => Ok(Method::Options),
            _ => Err(ErrorKind::InvalidMethod),
        }
    }

    /// Returns the method name as it appears on the wire.
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        }
    }

    /// `GET` and `HEAD` requests never carry a body visible to the handler,
    /// whatever their framing headers say.
    #[inline(always)]
    pub const fn allows_body(&self) -> bool {
        !matches!(self, Method::Get | Method::Head)
    }
}

// VERSION

/// HTTP protocol version
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum Version {
    /// HTTP/1.0 - [RFC 1945](https://tools.ietf.org/html/rfc1945)
    ///
    /// Connections close after each response unless the client sends
    /// `Connection: keep-alive`.
    Http10,

    /// HTTP/1.1 - [RFC 7230](https://tools.ietf.org/html/rfc7230) and related
    #[default]
    Http11,
}

impl Version {
    #[inline(always)]
    pub(crate) const fn from_bytes(src: &[u8]) -> Result<Self, ErrorKind> {
        match src {
            b"HTTP/1.1" => Ok(Self::Http11),
            b"HTTP/1.0" => Ok(Self::Http10),
            [b'H', b'T', b'T', b'P', b'/', ..] => Err(ErrorKind::UnsupportedVersion),
            _ => Err(ErrorKind::InvalidVersion),
        }
    }

    #[inline(always)]
    pub(crate) const fn default_keep_alive(&self) -> bool {
        matches!(self, Version::Http11)
    }
}

// STATUS_CODE

macro_rules! set_status_codes {
    ($(
        $(#[$docs:meta])*
        $name:ident = ($num:literal, $str:literal);
    )+) => {
        /// HTTP status codes
        ///
        /// Represents valid HTTP status codes as defined in
        /// [RFC 9110](https://datatracker.ietf.org/doc/html/rfc9110#section-15) and other standards.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum StatusCode { $(
            #[doc = concat!(stringify!($num), " ", $str)]
            $(#[$docs])*
            $name = $num,
        )+ }

        impl StatusCode {
            // Returns the HTTP first line as bytes (e.g., `b"HTTP/1.1 200 OK\r\n"`).
            #[inline]
            pub(crate) const fn to_first_line(&self, version: Version) -> &'static [u8] {
                match (self, version) { $(
                    (StatusCode::$name, Version::Http11) => {
                        concat!("HTTP/1.1 ", $num, " ", $str, "\r\n").as_bytes()
                    },
                    (StatusCode::$name, Version::Http10) => {
                        concat!("HTTP/1.0 ", $num, " ", $str, "\r\n").as_bytes()
                    },
                )+ }
            }

            /// Returns the canonical reason phrase (e.g. `"Not Found"`).
            #[inline]
            pub const fn reason(&self) -> &'static str {
                match self { $(
                    StatusCode::$name => $str,
                )+ }
            }

            /// Looks up a status code by its numeric value.
            #[inline]
            pub const fn from_u16(code: u16) -> Option<Self> {
                match code { $(
                    $num => Some(StatusCode::$name),
                )+
                    _ => None,
                }
            }
        }
    }
}

impl StatusCode {
    /// Returns the numeric value (e.g. `404`).
    #[inline(always)]
    pub const fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Responses that must not carry a body (`1xx`, `204`, `304`).
    #[inline(always)]
    pub(crate) const fn is_bodyless(&self) -> bool {
        matches!(self.as_u16(), 100..=199 | 204 | 304)
    }
}

impl Default for StatusCode {
    #[inline]
    fn default() -> Self {
        StatusCode::Ok
    }
}

set_status_codes! {
    Continue = (100, "Continue");
    /// Used by [`Response::upgrade`](crate::Response::upgrade).
    SwitchingProtocols = (101, "Switching Protocols");

    Ok = (200, "OK");
    Created = (201, "Created");
    Accepted = (202, "Accepted");
    NoContent = (204, "No Content");
    PartialContent = (206, "Partial Content");

    MovedPermanently = (301, "Moved Permanently");
    Found = (302, "Found");
    SeeOther = (303, "See Other");
    NotModified = (304, "Not Modified");
    TemporaryRedirect = (307, "Temporary Redirect");
    PermanentRedirect = (308, "Permanent Redirect");

    BadRequest = (400, "Bad Request");
    Unauthorized = (401, "Unauthorized");
    Forbidden = (403, "Forbidden");
    NotFound = (404, "Not Found");
    MethodNotAllowed = (405, "Method Not Allowed");
    RequestTimeout = (408, "Request Timeout");
    Conflict = (409, "Conflict");
    Gone = (410, "Gone");
    LengthRequired = (411, "Length Required");
    PayloadTooLarge = (413, "Payload Too Large");
    UriTooLong = (414, "URI Too Long");
    UnsupportedMediaType = (415, "Unsupported Media Type");
    /// Even if IANA reuses this code, the teapot stays.
    ImaTeapot = (418, "I'm a teapot");
    UnprocessableEntity = (422, "Unprocessable Entity");
    UpgradeRequired = (426, "Upgrade Required");
    TooManyRequests = (429, "Too Many Requests");
    RequestHeaderFieldsTooLarge = (431, "Request Header Fields Too Large");

    InternalServerError = (500, "Internal Server Error");
    NotImplemented = (501, "Not Implemented");
    BadGateway = (502, "Bad Gateway");
    ServiceUnavailable = (503, "Service Unavailable");
    GatewayTimeout = (504, "Gateway Timeout");
    HttpVersionNotSupported = (505, "HTTP Version Not Supported");
}
