//! Serialization of a [`Response`] onto its connection.

use crate::{
    errors::{Error, Result},
    http::{
        response::{write::write_u128, Body, Response},
        types::{Method, StatusCode, Version},
    },
    limits::RespLimits,
    server::{callback::OnUpgrade, date::DateCache, transport::ConnWriter},
};
use bytes::Bytes;
use futures_util::{stream::LocalBoxStream, StreamExt};
use std::io;
use tokio::io::AsyncWrite;

/// Properties of the request a response answers.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Exchange {
    pub(crate) version: Version,
    pub(crate) method: Method,
    pub(crate) keep_alive: bool,
}

/// What the connection does after a response has been written.
pub(crate) enum Written {
    KeepAlive,
    Close,
    Upgrade(OnUpgrade),
}

pub(crate) struct ResponseWriter<W> {
    io: ConnWriter<W>,
    buf: Vec<u8>,
    date: Option<DateCache>,
    limits: RespLimits,
}

impl<W: AsyncWrite + Unpin> ResponseWriter<W> {
    pub(crate) fn new(io: ConnWriter<W>, date: Option<DateCache>, limits: RespLimits) -> Self {
        Self {
            io,
            buf: Vec::with_capacity(limits.default_capacity),
            date,
            limits,
        }
    }

    #[inline]
    pub(crate) fn into_inner(self) -> W {
        self.io.into_inner()
    }

    pub(crate) async fn shutdown(&mut self) {
        self.io.shutdown().await;
    }

    /// Sends pre-serialized bytes, such as a canned error response.
    #[inline]
    pub(crate) async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.io.send(bytes).await
    }

    /// Writes one complete response.
    ///
    /// Head and small bodies leave in a single buffer. Streams are pumped
    /// chunk by chunk; a producer error aborts the response, shuts the write
    /// side down and is returned as [`Error::StreamProducer`].
    pub(crate) async fn write(&mut self, exchange: Exchange, response: Response) -> Result<Written> {
        let Response {
            status,
            headers,
            body,
            plain_text,
            close,
            on_upgrade,
        } = response;

        let streamed = matches!(body, Body::Stream(_));
        // HTTP/1.0 has no chunked framing: the end of the body is the end of the connection
        let unframed = streamed && exchange.version == Version::Http10;
        let keep_alive = exchange.keep_alive && !close && !unframed;
        let has_body = !status.is_bodyless();
        let send_body = has_body && exchange.method != Method::Head;

        self.reset_buffer();
        self.head(exchange.version, status, plain_text, &headers);

        if on_upgrade.is_none() {
            if let Some(line) = connection_header(exchange.version, keep_alive) {
                self.buf.extend_from_slice(line);
            }
        }

        match (&body, has_body) {
            (_, false) => {}
            (Body::Stream(_), true) if unframed => {}
            (Body::Stream(_), true) => self.buf.extend_from_slice(b"Transfer-Encoding: chunked\r\n"),
            (body, true) => {
                self.buf.extend_from_slice(b"Content-Length: ");
                write_u128(body.as_bytes().len() as u128, &mut self.buf);
                self.buf.extend_from_slice(b"\r\n");
            }
        }
        self.buf.extend_from_slice(b"\r\n");

        match body {
            Body::Stream(stream) if send_body => {
                self.io.send(&self.buf).await?;
                self.pump(stream, !unframed).await?;
            }
            body => {
                let bytes = match send_body {
                    true => body.as_bytes(),
                    false => &[],
                };

                if bytes.len() <= self.limits.copy_threshold {
                    self.buf.extend_from_slice(bytes);
                    self.io.send(&self.buf).await?;
                } else {
                    self.io.send(&self.buf).await?;
                    self.io.send(bytes).await?;
                }
            }
        }

        Ok(match on_upgrade {
            Some(on_upgrade) => Written::Upgrade(on_upgrade),
            None if keep_alive => Written::KeepAlive,
            None => Written::Close,
        })
    }

    #[inline]
    fn head(&mut self, version: Version, status: StatusCode, plain_text: bool, headers: &[u8]) {
        self.buf.extend_from_slice(status.to_first_line(version));

        if let Some(date) = &self.date {
            date.write_header(&mut self.buf);
        }
        if plain_text {
            self.buf
                .extend_from_slice(b"Content-Type: text/plain;charset=utf-8\r\n");
        }

        self.buf.extend_from_slice(headers);
    }

    async fn pump(
        &mut self,
        mut stream: LocalBoxStream<'static, io::Result<Bytes>>,
        chunked: bool,
    ) -> Result<()> {
        while let Some(next) = stream.next().await {
            let chunk = match next {
                Ok(chunk) => chunk,
                Err(err) => {
                    drop(stream);
                    self.io.shutdown().await;
                    return Err(Error::StreamProducer(err));
                }
            };

            // An empty chunk would read as the terminator
            if chunk.is_empty() {
                continue;
            }
            if !chunked {
                self.io.send(&chunk).await?;
                continue;
            }

            self.buf.clear();
            write_hex(chunk.len(), &mut self.buf);
            self.buf.extend_from_slice(b"\r\n");

            if chunk.len() <= self.limits.copy_threshold {
                self.buf.extend_from_slice(&chunk);
                self.buf.extend_from_slice(b"\r\n");
                self.io.send(&self.buf).await?;
            } else {
                self.io.send(&self.buf).await?;
                self.io.send(&chunk).await?;
                self.io.send(b"\r\n").await?;
            }
        }

        if chunked {
            self.io.send(b"0\r\n\r\n").await?;
        }
        Ok(())
    }

    #[inline]
    fn reset_buffer(&mut self) {
        if self.buf.capacity() > self.limits.max_capacity {
            self.buf = Vec::with_capacity(self.limits.default_capacity);
        } else {
            self.buf.clear();
        }
    }
}

#[inline]
const fn connection_header(version: Version, keep_alive: bool) -> Option<&'static [u8]> {
    match (version, keep_alive) {
        (Version::Http11, true) => None,
        (Version::Http11, false) => Some(b"Connection: close\r\n"),
        (Version::Http10, true) => Some(b"Connection: keep-alive\r\n"),
        (Version::Http10, false) => Some(b"Connection: close\r\n"),
    }
}

#[inline]
fn write_hex(mut n: usize, buffer: &mut Vec<u8>) {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";

    let mut digits = [0u8; 16];
    let mut i = digits.len();
    loop {
        i -= 1;
        digits[i] = DIGITS[n & 0xf];
        n >>= 4;
        if n == 0 {
            break;
        }
    }

    buffer.extend_from_slice(&digits[i..]);
}
