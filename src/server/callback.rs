//! Binding of the single application handler to the connection driver.
//!
//! The shape of the handler (with or without a request argument, sync or
//! async) is fixed when it is bound and never inspected again per request.

use crate::{
    errors::HandlerError,
    http::{request::Request, response::Response},
    server::transport::Io,
};
use bytes::{Buf, Bytes};
use futures_util::future::{FutureExt, LocalBoxFuture};
use std::{
    fmt,
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// What a handler produces for one request.
pub type HandlerResult = Result<Response, HandlerError>;

/// Maps a handler failure to a response. If the hook itself fails, the
/// connection is closed.
pub type ErrorHook = Arc<dyn Fn(HandlerError) -> HandlerResult + Send + Sync>;

/// Called once the listener is bound, with its resolved local address.
pub type ListenHook = Arc<dyn Fn(SocketAddr) + Send + Sync>;

pub(crate) type OnUpgrade =
    Box<dyn FnOnce(Upgraded) -> LocalBoxFuture<'static, Result<(), HandlerError>>>;

/// A request handler implemented on a type.
///
/// The request is passed by value, so the returned future can hold on to it
/// across `.await` points; its token stays valid until the response is sent.
///
/// # Examples
/// ```no_run
/// use flashline::{Handler, HandlerResult, Request, Response, Server, StatusCode};
///
/// struct Echo;
///
/// impl Handler for Echo {
///     async fn handle(&self, request: Request) -> HandlerResult {
///         let body = match request.body()? {
///             Some(body) => body.bytes().await?,
///             None => return Ok(Response::new(StatusCode::BadRequest)),
///         };
///
///         Ok(Response::new(StatusCode::Ok).body(body))
///     }
/// }
///
/// # #[tokio::main]
/// # async fn main() -> flashline::Result<()> {
/// Server::builder().handler(Echo).build()?.launch().await
/// # }
/// ```
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> impl Future<Output = HandlerResult>;
}

/// The bound handler, classified once.
#[derive(Clone)]
pub enum Callback {
    /// Ignores the request; answered inline.
    NoArg(Arc<dyn Fn() -> HandlerResult + Send + Sync>),
    /// Reads the request; answered inline.
    Sync(Arc<dyn Fn(&Request) -> HandlerResult + Send + Sync>),
    AsyncNoArg(Arc<dyn Fn() -> LocalBoxFuture<'static, HandlerResult> + Send + Sync>),
    Async(Arc<dyn Fn(Request) -> LocalBoxFuture<'static, HandlerResult> + Send + Sync>),
}

pub(crate) enum Reply {
    Ready(HandlerResult),
    Pending(LocalBoxFuture<'static, HandlerResult>),
}

impl Callback {
    pub fn no_arg<F>(f: F) -> Self
    where
        F: Fn() -> HandlerResult + Send + Sync + 'static,
    {
        Callback::NoArg(Arc::new(f))
    }

    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&Request) -> HandlerResult + Send + Sync + 'static,
    {
        Callback::Sync(Arc::new(f))
    }

    pub fn async_no_arg<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + 'static,
    {
        Callback::AsyncNoArg(Arc::new(move || f().boxed_local()))
    }

    pub fn asynchronous<F, Fut>(f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + 'static,
    {
        Callback::Async(Arc::new(move |request| f(request).boxed_local()))
    }

    pub fn handler<H: Handler>(handler: H) -> Self {
        let handler = Arc::new(handler);

        Callback::Async(Arc::new(move |request| {
            let handler = Arc::clone(&handler);
            async move { handler.handle(request).await }.boxed_local()
        }))
    }

    #[inline]
    pub(crate) fn call(&self, request: Request) -> Reply {
        match self {
            Callback::NoArg(f) => Reply::Ready(f()),
            Callback::Sync(f) => Reply::Ready(f(&request)),
            Callback::AsyncNoArg(f) => Reply::Pending(f()),
            Callback::Async(f) => Reply::Pending(f(request)),
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Callback::NoArg(_) => "Callback::NoArg",
            Callback::Sync(_) => "Callback::Sync",
            Callback::AsyncNoArg(_) => "Callback::AsyncNoArg",
            Callback::Async(_) => "Callback::Async",
        })
    }
}

/// A connection that stopped speaking HTTP after a `101` response.
///
/// Bytes the client sent after the upgrade request, and that were already
/// read off the socket, are returned by the first reads.
pub struct Upgraded {
    io: Box<dyn Io>,
    read_buf: Bytes,
}

impl Upgraded {
    pub(crate) fn new(io: Box<dyn Io>, read_buf: Bytes) -> Self {
        Self { io, read_buf }
    }

    /// Splits into the raw transport and the bytes already read from it.
    pub fn into_parts(self) -> (Box<dyn Io>, Bytes) {
        (self.io, self.read_buf)
    }
}

impl fmt::Debug for Upgraded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgraded")
            .field("buffered", &self.read_buf.len())
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Upgraded {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buf.is_empty() {
            let n = self.read_buf.len().min(buf.remaining());
            buf.put_slice(&self.read_buf[..n]);
            self.read_buf.advance(n);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Upgraded {
    #[inline]
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    #[inline]
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    #[inline]
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod callback_tests {
    use super::*;
    use crate::StatusCode;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn upgraded_replays_buffered_bytes() {
        let (server, mut client) = duplex(64);
        let mut upgraded = Upgraded::new(Box::new(server), Bytes::from_static(b"early"));

        client.write_all(b" late").await.unwrap();

        let mut first = [0u8; 3];
        upgraded.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"ear");

        let mut rest = [0u8; 7];
        upgraded.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"ly late");

        upgraded.write_all(b"pong").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"pong");
    }

    #[test]
    fn no_arg_is_answered_inline() {
        let callback = Callback::no_arg(|| Ok(Response::new(StatusCode::Accepted)));
        assert!(matches!(callback, Callback::NoArg(_)));
        assert_eq!(format!("{callback:?}"), "Callback::NoArg");

        let async_callback = Callback::async_no_arg(|| async { Ok(Response::text("later")) });
        assert!(matches!(async_callback, Callback::AsyncNoArg(_)));
    }
}
