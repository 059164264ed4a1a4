//! flashline - minimal-overhead HTTP/1.1 server core
//!
//! Every in-flight request lives in a per-worker slab and is addressed by a
//! [`Token`]. Handlers receive a [`Request`] handle that reads through that
//! token, so a request outliving its response is rejected instead of
//! observing a recycled slot.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections, pipelining, chunked request and
//!   response bodies, `Upgrade`
//! - **HTTP/1.0**: `keep-alive` on request, unframed streamed responses
//!
//! # Performance Characteristics
//!
//! - **Fast path** - a response whose bytes fit in one buffer is written with
//!   a single non-blocking attempt before any future is created
//! - **Inline handlers** - sync handlers are answered without scheduling
//! - **Cached `Date`** - formatted once per second per server
//! - **Thread per core** - with [`reuse_port`](ServerBuilder::reuse_port)
//!   every worker owns a listener, a runtime and a slab
//!
//! # Examples
//!
//! Quick start:
//! ```no_run
//! use flashline::{Response, Server};
//!
//! #[tokio::main]
//! async fn main() -> flashline::Result<()> {
//!     Server::builder()
//!         .port(8080)
//!         .handler_fn0(|| Ok(Response::text("Hello World")))
//!         .build()?
//!         .launch()
//!         .await
//! }
//! ```
//! Routing on the request:
//! ```no_run
//! use flashline::{Method, Request, Response, Server, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> flashline::Result<()> {
//!     Server::builder()
//!         .port(8080)
//!         .handler_async(|req: Request| async move {
//!             Ok::<_, flashline::HandlerError>(match (req.method(), &req.target()?[..]) {
//!                 (Method::Get, b"/") => Response::text("Hello World"),
//!                 (Method::Post, b"/echo") => match req.body()? {
//!                     Some(body) => Response::new(StatusCode::Ok).stream(body),
//!                     None => Response::new(StatusCode::BadRequest),
//!                 },
//!                 _ => Response::new(StatusCode::NotFound),
//!             })
//!         })
//!         .build()?
//!         .launch()
//!         .await
//! }
//! ```
//! WebSocket-style upgrade:
//! ```no_run
//! use flashline::{Response, Server, StatusCode};
//! use tokio::io::copy;
//!
//! #[tokio::main]
//! async fn main() -> flashline::Result<()> {
//!     Server::builder()
//!         .handler_fn(|req| {
//!             if req.header("upgrade")?.is_none() {
//!                 return Ok(Response::new(StatusCode::BadRequest));
//!             }
//!             Ok(Response::upgrade(|io| async move {
//!                 let (mut rd, mut wr) = tokio::io::split(io);
//!                 copy(&mut rd, &mut wr).await?;
//!                 Ok::<_, flashline::HandlerError>(())
//!             })
//!             .header("Upgrade", "echo")
//!             .header("Connection", "Upgrade"))
//!         })
//!         .build()?
//!         .launch()
//!         .await
//! }
//! ```

pub(crate) mod http {
    pub(crate) mod parser;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod callback;
    pub(crate) mod connection;
    pub(crate) mod date;
    pub(crate) mod server_impl;
    pub(crate) mod slab;
    pub(crate) mod transport;
    pub(crate) mod writer;
}
pub(crate) mod errors;
pub mod limits;
#[cfg(feature = "tls")]
pub(crate) mod tls;

pub use crate::{
    errors::{Error, HandlerError, Result},
    http::{
        request::{Request, RequestBody},
        response::{
            write::{BodyWriter, WriteBuffer},
            Body, Response,
        },
        types::{Method, StatusCode, Version},
    },
    server::{
        callback::{Callback, ErrorHook, Handler, HandlerResult, ListenHook, Upgraded},
        date::{DateCache, DATE_TICK},
        server_impl::{serve, ServeOptions, Server, ServerBuilder, Shutdown},
        slab::Token,
        transport::{Io, RemoteAddr, TransportKind},
    },
};

#[cfg(test)]
pub mod tools {
    use std::str::from_utf8;

    #[inline]
    pub fn str(value: Option<&[u8]>) -> Option<&str> {
        Some(from_utf8(value?).unwrap())
    }

    #[inline]
    pub fn str_op(value: &[u8]) -> &str {
        from_utf8(value).unwrap()
    }

    #[inline]
    pub fn str_2<'a>(value: (&'a [u8], &'a [u8])) -> (&'a str, &'a str) {
        (from_utf8(value.0).unwrap(), from_utf8(value.1).unwrap())
    }
}
