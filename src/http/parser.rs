//! Incremental HTTP/1.x request parser.
//!
//! The parser never owns the bytes it looks at. The connection hands it the
//! whole unconsumed read buffer on every call to [`Parser::feed`]; the parser
//! remembers how far it got, so bytes that were already examined are not
//! scanned again when more data arrives.
//!
//! All positions it reports are offsets from the start of that buffer. Once
//! [`ParseEvent::HeaderComplete`] is returned the caller splits `head_len`
//! bytes off the front of its buffer, and every reported range stays valid
//! inside that head.

use crate::{
    errors::ErrorKind,
    http::types::{header_tokens, slice_to_u64, Method, Version},
    limits::ReqLimits,
};
use bytes::{Buf, Bytes, BytesMut};
use memchr::{memchr, memrchr};
use std::ops::Range;

/// How the end of a request body is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    None,
    Length(u64),
    Chunked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ParseEvent {
    NeedMoreData,
    RequestLine {
        method: Method,
        target: Range<usize>,
        version: Version,
    },
    HeaderComplete {
        head_len: usize,
        framing: BodyFraming,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    RequestLine,
    Headers,
    Done,
}

#[derive(Debug)]
pub(crate) struct Parser {
    stage: Stage,
    /// Start of the first line not yet consumed.
    pos: usize,
    /// Everything before this offset is known to contain no `\n`.
    scanned: usize,

    method: Method,
    version: Version,
    headers: Vec<(Range<usize>, Range<usize>)>,

    content_length: Option<u64>,
    transfer_encoding: bool,
    chunked: bool,
    conn_close: bool,
    conn_keep_alive: bool,
    conn_upgrade: bool,
    upgrade_header: bool,

    head_size: usize,
    header_count: usize,
    body_size: u64,
}

impl Parser {
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Self {
            stage: Stage::RequestLine,
            pos: 0,
            scanned: 0,

            method: Method::Get,
            version: Version::Http11,
            headers: Vec::with_capacity(limits.header_count.min(32)),

            content_length: None,
            transfer_encoding: false,
            chunked: false,
            conn_close: false,
            conn_keep_alive: false,
            conn_upgrade: false,
            upgrade_header: false,

            head_size: limits.head_size,
            header_count: limits.header_count,
            body_size: limits.body_size,
        }
    }

    /// Prepares for the next request on the connection.
    #[inline]
    pub(crate) fn reset(&mut self) {
        self.stage = Stage::RequestLine;
        self.pos = 0;
        self.scanned = 0;

        self.method = Method::Get;
        self.version = Version::Http11;
        self.headers.clear();

        self.content_length = None;
        self.transfer_encoding = false;
        self.chunked = false;
        self.conn_close = false;
        self.conn_keep_alive = false;
        self.conn_upgrade = false;
        self.upgrade_header = false;
    }

    /// Advances over `buf`, which must start with the bytes of the request
    /// currently being parsed and only ever grow between calls.
    pub(crate) fn feed(&mut self, buf: &[u8]) -> Result<ParseEvent, ErrorKind> {
        loop {
            match self.stage {
                Stage::RequestLine => {
                    // Stray CRLFs between pipelined requests are tolerated
                    while buf[self.pos..].starts_with(b"\r\n") {
                        self.pos += 2;
                        self.scanned = self.pos;
                    }

                    let Some(end) = self.next_line(buf, ErrorKind::InvalidVersion)? else {
                        return Ok(ParseEvent::NeedMoreData);
                    };

                    let (method, target, version) = Self::request_line(buf, self.pos, end)?;
                    self.method = method;
                    self.version = version;
                    self.consume_line(end);
                    self.stage = Stage::Headers;

                    return Ok(ParseEvent::RequestLine {
                        method,
                        target,
                        version,
                    });
                }
                Stage::Headers => {
                    let Some(end) = self.next_line(buf, ErrorKind::InvalidHeader)? else {
                        return Ok(ParseEvent::NeedMoreData);
                    };

                    if end == self.pos {
                        self.consume_line(end);
                        simdutf8::basic::from_utf8(&buf[..self.pos])
                            .map_err(|_| ErrorKind::InvalidEncoding)?;

                        let framing = self.framing()?;
                        self.stage = Stage::Done;

                        return Ok(ParseEvent::HeaderComplete {
                            head_len: self.pos,
                            framing,
                        });
                    }

                    self.header(buf, self.pos, end)?;
                    self.consume_line(end);
                }
                Stage::Done => self.reset(),
            }
        }
    }

    #[inline(always)]
    pub(crate) fn headers(&self) -> &[(Range<usize>, Range<usize>)] {
        &self.headers
    }

    #[inline]
    pub(crate) fn keep_alive(&self) -> bool {
        match (self.conn_close, self.conn_keep_alive) {
            (true, _) => false,
            (false, true) => true,
            (false, false) => self.version.default_keep_alive(),
        }
    }

    /// `Connection: upgrade` together with a non-empty `Upgrade` header.
    #[inline]
    pub(crate) fn upgrade(&self) -> bool {
        self.conn_upgrade && self.upgrade_header
    }
}

// Lines
impl Parser {
    /// Returns the offset of the `\r\n` ending the current line, if it has arrived.
    #[inline]
    fn next_line(&mut self, buf: &[u8], bare_lf: ErrorKind) -> Result<Option<usize>, ErrorKind> {
        let from = self.scanned.max(self.pos);

        let Some(found) = memchr(b'\n', &buf[from..]) else {
            self.scanned = buf.len();
            return match buf.len() >= self.head_size {
                true => Err(ErrorKind::HeadTooLarge),
                false => Ok(None),
            };
        };

        let lf = from + found;
        if lf + 1 > self.head_size {
            return Err(ErrorKind::HeadTooLarge);
        }
        if lf == self.pos || buf[lf - 1] != b'\r' {
            return Err(bare_lf);
        }

        Ok(Some(lf - 1))
    }

    #[inline(always)]
    fn consume_line(&mut self, end: usize) {
        self.pos = end + 2;
        self.scanned = self.pos;
    }
}

// Request line
impl Parser {
    #[inline]
    fn request_line(
        buf: &[u8],
        start: usize,
        end: usize,
    ) -> Result<(Method, Range<usize>, Version), ErrorKind> {
        let line = &buf[start..end];

        let method_end = memchr(b' ', line).ok_or(ErrorKind::InvalidMethod)?;
        let method = Method::from_bytes(&line[..method_end])?;

        let rest = &line[method_end + 1..];
        let target_len = memrchr(b' ', rest).ok_or(ErrorKind::InvalidVersion)?;
        let version = Version::from_bytes(&rest[target_len + 1..])?;

        let target = &rest[..target_len];
        if !Self::valid_target(target) {
            return Err(ErrorKind::InvalidUrl);
        }

        let target_start = start + method_end + 1;
        Ok((method, target_start..target_start + target_len, version))
    }

    #[inline]
    fn valid_target(target: &[u8]) -> bool {
        let shape = match target {
            [b'/', ..] | b"*" => true,
            _ => target.starts_with(b"http://") || target.starts_with(b"https://"),
        };

        shape && target.iter().all(|b| *b > b' ' && *b != 0x7f)
    }
}

// Headers
impl Parser {
    #[inline]
    fn header(&mut self, buf: &[u8], start: usize, end: usize) -> Result<(), ErrorKind> {
        if self.headers.len() >= self.header_count {
            return Err(ErrorKind::TooManyHeaders);
        }

        let line = &buf[start..end];
        let colon = memchr(b':', line).ok_or(ErrorKind::InvalidHeader)?;

        // Also rejects obsolete line folding, which starts with whitespace
        let name = &line[..colon];
        if name.is_empty() || !name.iter().all(|b| is_token_char(*b)) {
            return Err(ErrorKind::InvalidHeader);
        }

        let raw_value = &line[colon + 1..];
        let value = raw_value.trim_ascii();
        if memchr(b'\r', value).is_some() {
            return Err(ErrorKind::InvalidHeader);
        }

        let value_start = start + colon + 1 + (raw_value.len() - raw_value.trim_ascii_start().len());
        self.headers
            .push((start..start + colon, value_start..value_start + value.len()));

        self.interpret(name, value)
    }

    /// Picks up the headers that decide framing and connection reuse.
    #[inline]
    fn interpret(&mut self, name: &[u8], value: &[u8]) -> Result<(), ErrorKind> {
        if name.eq_ignore_ascii_case(b"content-length") {
            if value.is_empty() {
                return Err(ErrorKind::InvalidContentLength);
            }

            // `Content-Length: 5, 5` and repeated identical headers are fine
            for token in header_tokens(value) {
                let len = slice_to_u64(token).ok_or(ErrorKind::InvalidContentLength)?;
                match self.content_length {
                    Some(prev) if prev != len => return Err(ErrorKind::InvalidContentLength),
                    _ => self.content_length = Some(len),
                }
            }
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            self.transfer_encoding = true;

            for token in header_tokens(value) {
                if self.chunked || !token.eq_ignore_ascii_case(b"chunked") {
                    return Err(ErrorKind::UnsupportedTransferEncoding);
                }
                self.chunked = true;
            }
        } else if name.eq_ignore_ascii_case(b"connection") {
            for token in header_tokens(value) {
                if token.eq_ignore_ascii_case(b"close") {
                    self.conn_close = true;
                } else if token.eq_ignore_ascii_case(b"keep-alive") {
                    self.conn_keep_alive = true;
                } else if token.eq_ignore_ascii_case(b"upgrade") {
                    self.conn_upgrade = true;
                }
            }
        } else if name.eq_ignore_ascii_case(b"upgrade") {
            self.upgrade_header = !value.is_empty();
        }

        Ok(())
    }

    fn framing(&self) -> Result<BodyFraming, ErrorKind> {
        if self.transfer_encoding {
            if self.content_length.is_some() {
                return Err(ErrorKind::ConflictingFraming);
            }
            if !self.chunked || self.version == Version::Http10 {
                return Err(ErrorKind::UnsupportedTransferEncoding);
            }

            return Ok(BodyFraming::Chunked);
        }

        match self.content_length {
            Some(len) if len > self.body_size => Err(ErrorKind::BodyTooLarge),
            Some(0) | None => Ok(BodyFraming::None),
            Some(len) => Ok(BodyFraming::Length(len)),
        }
    }
}

#[inline(always)]
fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

//

/// Result of one [`ChunkedDecoder::decode`] step.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Decoded {
    Data(Bytes),
    NeedMoreData,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

/// Decodes a `Transfer-Encoding: chunked` body straight out of the
/// connection's read buffer. Chunk extensions and trailers are skipped.
#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: ChunkState,
    total: u64,
    limit: u64,
}

const MAX_CHUNK_LINE: usize = 1024;

impl ChunkedDecoder {
    pub(crate) fn new(limit: u64) -> Self {
        Self {
            state: ChunkState::Size,
            total: 0,
            limit,
        }
    }

    /// Takes as much of the body out of `buf` as is available. Bytes after
    /// the end of the body are left in `buf`.
    pub(crate) fn decode(&mut self, buf: &mut BytesMut) -> Result<Decoded, ErrorKind> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let Some(end) = Self::line_end(buf)? else {
                        return Ok(Decoded::NeedMoreData);
                    };

                    let line = &buf[..end];
                    let digits = match memchr(b';', line) {
                        Some(ext) => &line[..ext],
                        None => line,
                    };
                    let size = parse_hex(digits.trim_ascii()).ok_or(ErrorKind::InvalidChunk)?;
                    buf.advance(end + 2);

                    if size == 0 {
                        self.state = ChunkState::Trailers;
                        continue;
                    }

                    self.total = self.total.saturating_add(size);
                    if self.total > self.limit {
                        return Err(ErrorKind::BodyTooLarge);
                    }
                    self.state = ChunkState::Data(size);
                }
                ChunkState::Data(remaining) => {
                    if buf.is_empty() {
                        return Ok(Decoded::NeedMoreData);
                    }

                    let take = remaining.min(buf.len() as u64);
                    let chunk = buf.split_to(take as usize).freeze();

                    self.state = match remaining - take {
                        0 => ChunkState::DataEnd,
                        left => ChunkState::Data(left),
                    };
                    return Ok(Decoded::Data(chunk));
                }
                ChunkState::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(Decoded::NeedMoreData);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(ErrorKind::InvalidChunk);
                    }

                    buf.advance(2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    let Some(end) = Self::line_end(buf)? else {
                        return Ok(Decoded::NeedMoreData);
                    };

                    buf.advance(end + 2);
                    if end == 0 {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => return Ok(Decoded::Done),
            }
        }
    }

    #[inline]
    fn line_end(buf: &[u8]) -> Result<Option<usize>, ErrorKind> {
        match memchr(b'\n', buf) {
            Some(lf) if lf > 0 && buf[lf - 1] == b'\r' => Ok(Some(lf - 1)),
            Some(_) => Err(ErrorKind::InvalidChunk),
            None if buf.len() > MAX_CHUNK_LINE => Err(ErrorKind::InvalidChunk),
            None => Ok(None),
        }
    }
}

#[inline]
fn parse_hex(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() || digits.len() > 16 {
        return None;
    }

    digits.iter().try_fold(0u64, |acc, &b| {
        let digit = (b as char).to_digit(16)? as u64;
        Some(acc << 4 | digit)
    })
}

#[cfg(test)]
mod parser_tests {
    use super::*;
    use crate::tools::*;

    fn parse_all(src: &[u8]) -> Result<(Parser, Vec<ParseEvent>), ErrorKind> {
        let mut parser = Parser::new(&ReqLimits::default());
        let mut events = Vec::new();

        loop {
            match parser.feed(src)? {
                ParseEvent::NeedMoreData => return Ok((parser, events)),
                event @ ParseEvent::HeaderComplete { .. } => {
                    events.push(event);
                    return Ok((parser, events));
                }
                event => events.push(event),
            }
        }
    }

    fn framing_of(src: &str) -> Result<BodyFraming, ErrorKind> {
        let (_, events) = parse_all(src.as_bytes())?;
        match events.last() {
            Some(ParseEvent::HeaderComplete { framing, .. }) => Ok(*framing),
            other => panic!("head not complete: {other:?}"),
        }
    }

    #[test]
    fn simple_get() {
        let src = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let (parser, events) = parse_all(src).unwrap();

        assert_eq!(
            events,
            [
                ParseEvent::RequestLine {
                    method: Method::Get,
                    target: 4..5,
                    version: Version::Http11
                },
                ParseEvent::HeaderComplete {
                    head_len: src.len(),
                    framing: BodyFraming::None
                },
            ]
        );

        let (name, value) = parser.headers()[0].clone();
        assert_eq!(str_2((&src[name], &src[value])), ("Host", "x"));
        assert!(parser.keep_alive());
        assert!(!parser.upgrade());
    }

    #[test]
    fn byte_by_byte() {
        let src = b"POST /api/items?id=3 HTTP/1.1\r\nContent-Length:  4 \r\nX-Trace: a b\r\n\r\nbody";
        let mut parser = Parser::new(&ReqLimits::default());
        let mut events = Vec::new();

        for end in 1..=src.len() {
            loop {
                match parser.feed(&src[..end]).unwrap() {
                    ParseEvent::NeedMoreData => break,
                    event => events.push(event),
                }
                if matches!(events.last(), Some(ParseEvent::HeaderComplete { .. })) {
                    break;
                }
            }
            if matches!(events.last(), Some(ParseEvent::HeaderComplete { .. })) {
                break;
            }
        }

        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            ParseEvent::HeaderComplete {
                head_len: src.len() - 4,
                framing: BodyFraming::Length(4)
            }
        );
        if let ParseEvent::RequestLine { target, .. } = &events[0] {
            assert_eq!(str_op(&src[target.clone()]), "/api/items?id=3");
        }

        let values: Vec<_> = parser
            .headers()
            .iter()
            .map(|(n, v)| str_2((&src[n.clone()], &src[v.clone()])))
            .collect();
        assert_eq!(values, [("Content-Length", "4"), ("X-Trace", "a b")]);
    }

    #[test]
    fn invalid_heads() {
        #[rustfmt::skip]
        let cases = [
            ("get / HTTP/1.1\r\n\r\n",              ErrorKind::InvalidMethod),
            ("GET\r\n\r\n",                         ErrorKind::InvalidMethod),
            ("GET /\r\n\r\n",                       ErrorKind::InvalidVersion),
            ("GET / HTTP/2.0\r\n\r\n",              ErrorKind::UnsupportedVersion),
            ("GET / HTTX/1.1\r\n\r\n",              ErrorKind::InvalidVersion),
            ("GET / HTTP/1.1\n\r\n",                ErrorKind::InvalidVersion),
            ("GET api HTTP/1.1\r\n\r\n",            ErrorKind::InvalidUrl),
            ("GET  HTTP/1.1\r\n\r\n",               ErrorKind::InvalidUrl),
            ("GET /a b HTTP/1.1\r\n\r\n",           ErrorKind::InvalidUrl),
            ("GET / HTTP/1.1\r\nNo colon\r\n\r\n",  ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\nA : b\r\n\r\n",     ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\n: b\r\n\r\n",       ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\nA: b\r\n c\r\n\r\n", ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\nA: b\n\r\n",        ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\nA: b\rc\r\n\r\n",   ErrorKind::InvalidHeader),
        ];

        for (src, expected) in cases {
            assert_eq!(parse_all(src.as_bytes()).err(), Some(expected), "{src:?}");
        }
    }

    #[test]
    fn body_framing() {
        #[rustfmt::skip]
        let cases = [
            ("GET / HTTP/1.1\r\n\r\n",                                    Ok(BodyFraming::None)),
            ("POST / HTTP/1.1\r\nContent-Length: 0\r\n\r\n",              Ok(BodyFraming::None)),
            ("POST / HTTP/1.1\r\nContent-Length: 12\r\n\r\n",             Ok(BodyFraming::Length(12))),
            ("POST / HTTP/1.1\r\nContent-Length: 3, 3\r\n\r\n",           Ok(BodyFraming::Length(3))),
            ("POST / HTTP/1.1\r\ncontent-length: 3\r\nContent-Length: 3\r\n\r\n", Ok(BodyFraming::Length(3))),
            ("POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",     Ok(BodyFraming::Chunked)),
            ("POST / HTTP/1.1\r\nTransfer-Encoding: Chunked\r\n\r\n",     Ok(BodyFraming::Chunked)),

            ("POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\n", Err(ErrorKind::InvalidContentLength)),
            ("POST / HTTP/1.1\r\nContent-Length: 3, 4\r\n\r\n",           Err(ErrorKind::InvalidContentLength)),
            ("POST / HTTP/1.1\r\nContent-Length: -1\r\n\r\n",             Err(ErrorKind::InvalidContentLength)),
            ("POST / HTTP/1.1\r\nContent-Length:\r\n\r\n",                Err(ErrorKind::InvalidContentLength)),
            ("POST / HTTP/1.1\r\nContent-Length: 999999999999\r\n\r\n",   Err(ErrorKind::BodyTooLarge)),
            ("POST / HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n", Err(ErrorKind::ConflictingFraming)),
            ("POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Length: 3\r\n\r\n", Err(ErrorKind::ConflictingFraming)),
            ("POST / HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\n\r\n", Err(ErrorKind::UnsupportedTransferEncoding)),
            ("POST / HTTP/1.1\r\nTransfer-Encoding: chunked, gzip\r\n\r\n", Err(ErrorKind::UnsupportedTransferEncoding)),
            ("POST / HTTP/1.1\r\nTransfer-Encoding:\r\n\r\n",             Err(ErrorKind::UnsupportedTransferEncoding)),
            ("POST / HTTP/1.0\r\nTransfer-Encoding: chunked\r\n\r\n",     Err(ErrorKind::UnsupportedTransferEncoding)),
        ];

        for (src, expected) in cases {
            assert_eq!(framing_of(src), expected, "{src:?}");
        }
    }

    #[test]
    fn connection_semantics() {
        #[rustfmt::skip]
        let cases = [
            ("GET / HTTP/1.1\r\n\r\n",                                          true,  false),
            ("GET / HTTP/1.1\r\nConnection: close\r\n\r\n",                     false, false),
            ("GET / HTTP/1.1\r\nConnection: keep-alive, close\r\n\r\n",         false, false),
            ("GET / HTTP/1.0\r\n\r\n",                                          false, false),
            ("GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n",                true,  false),
            ("GET / HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n",  true,  true),
            ("GET / HTTP/1.1\r\nUpgrade: echo\r\n\r\n",                         true,  false),
            ("GET / HTTP/1.1\r\nConnection: upgrade\r\n\r\n",                   true,  false),
        ];

        for (src, keep_alive, upgrade) in cases {
            let (parser, _) = parse_all(src.as_bytes()).unwrap();
            assert_eq!((parser.keep_alive(), parser.upgrade()), (keep_alive, upgrade), "{src:?}");
        }
    }

    #[test]
    fn limits() {
        let limits = ReqLimits {
            head_size: 64,
            header_count: 2,
            ..ReqLimits::default()
        };

        let mut parser = Parser::new(&limits);
        let src = "GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\nC: 3\r\n\r\n";
        let err = loop {
            match parser.feed(src.as_bytes()) {
                Ok(ParseEvent::NeedMoreData) => panic!("should fail"),
                Ok(_) => continue,
                Err(err) => break err,
            }
        };
        assert_eq!(err, ErrorKind::TooManyHeaders);

        let mut parser = Parser::new(&limits);
        let long = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(80));
        assert_eq!(parser.feed(long.as_bytes()), Err(ErrorKind::HeadTooLarge));

        let mut parser = Parser::new(&limits);
        let unterminated = "GET /".to_string() + &"a".repeat(70);
        assert_eq!(parser.feed(unterminated.as_bytes()), Err(ErrorKind::HeadTooLarge));
    }

    #[test]
    fn non_utf8_head() {
        let src = b"GET / HTTP/1.1\r\nX-Name: \xff\xfe\r\n\r\n";
        assert_eq!(parse_all(src).err(), Some(ErrorKind::InvalidEncoding));
    }

    #[test]
    fn leading_crlf_and_reuse() {
        let mut parser = Parser::new(&ReqLimits::default());
        let src = b"\r\nGET /x HTTP/1.1\r\n\r\n";

        assert!(matches!(
            parser.feed(src),
            Ok(ParseEvent::RequestLine { target, .. }) if target == (6..8)
        ));
        assert!(matches!(
            parser.feed(src),
            Ok(ParseEvent::HeaderComplete { head_len: 21, .. })
        ));

        // The next request starts from a fresh buffer
        let next = b"DELETE /y HTTP/1.0\r\n\r\n";
        assert!(matches!(
            parser.feed(next),
            Ok(ParseEvent::RequestLine { method: Method::Delete, version: Version::Http10, .. })
        ));
        assert!(parser.headers().is_empty());
    }

    #[test]
    fn chunked_fragmented() {
        let wire = b"4\r\nWiki\r\n5;ext=1\r\npedia\r\nE\r\n in\r\n\r\nchunks.\r\n0\r\nX-Trailer: 1\r\n\r\nGET";
        let mut decoder = ChunkedDecoder::new(1024);
        let mut buf = BytesMut::new();
        let mut body = Vec::new();

        for byte in wire {
            buf.extend_from_slice(&[*byte]);
            loop {
                match decoder.decode(&mut buf).unwrap() {
                    Decoded::Data(chunk) => body.extend_from_slice(&chunk),
                    Decoded::NeedMoreData | Decoded::Done => break,
                }
            }
        }

        assert_eq!(str_op(&body), "Wikipedia in\r\n\r\nchunks.");
        assert_eq!(decoder.decode(&mut buf), Ok(Decoded::Done));
        assert_eq!(&buf[..], b"GET");
    }

    #[test]
    fn chunked_errors() {
        #[rustfmt::skip]
        let cases = [
            ("zz\r\n",                   ErrorKind::InvalidChunk),
            ("\r\n",                     ErrorKind::InvalidChunk),
            ("3\nabc\r\n",               ErrorKind::InvalidChunk),
            ("3\r\nabcX\r\n",            ErrorKind::InvalidChunk),
            ("11111111111111111\r\n",    ErrorKind::InvalidChunk),
            ("400\r\n",                  ErrorKind::BodyTooLarge),
        ];

        for (src, expected) in cases {
            let mut decoder = ChunkedDecoder::new(16);
            let mut buf = BytesMut::from(src);
            let err = loop {
                match decoder.decode(&mut buf) {
                    Ok(Decoded::Data(_)) => continue,
                    Ok(other) => panic!("{src:?}: {other:?}"),
                    Err(err) => break err,
                }
            };
            assert_eq!(err, expected, "{src:?}");
        }
    }
}
