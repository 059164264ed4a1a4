//! Listening sockets, the plain/TLS transport and the two write paths.

use crate::errors::{Error, Result};
use futures_util::task::noop_waker_ref;
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    io,
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
    time::timeout,
};

/// Anything a connection can be served over.
pub trait Io: AsyncRead + AsyncWrite + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + 'static> Io for T {}

/// Kind of transport a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Tls,
}

/// Address of the peer that sent a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteAddr {
    pub transport: TransportKind,
    pub ip: IpAddr,
    pub port: u16,
}

impl RemoteAddr {
    #[inline]
    pub(crate) fn new(transport: TransportKind, addr: SocketAddr) -> Self {
        Self {
            transport,
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

/// Accepted connection, plain or TLS-terminated.
pub(crate) enum Transport {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

macro_rules! delegate {
    ($self:ident, $io:ident => $call:expr) => {
        match $self.get_mut() {
            Transport::Plain($io) => $call,
            #[cfg(feature = "tls")]
            Transport::Tls($io) => $call,
        }
    };
}

impl AsyncRead for Transport {
    #[inline]
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        delegate!(self, io => Pin::new(io).poll_read(cx, buf))
    }
}

impl AsyncWrite for Transport {
    #[inline]
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        delegate!(self, io => Pin::new(io).poll_write(cx, buf))
    }

    #[inline]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self, io => Pin::new(io).poll_flush(cx))
    }

    #[inline]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self, io => Pin::new(io).poll_shutdown(cx))
    }
}

//

/// Resolves the configured host. An empty host means every IPv4 interface
/// and bracketed IPv6 literals (`[::1]`) are accepted.
pub(crate) fn resolve_addr(hostname: &str, port: u16) -> Result<SocketAddr> {
    let host = match hostname {
        "" => "0.0.0.0",
        host => host.trim_start_matches('[').trim_end_matches(']'),
    };

    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or(Error::Config("hostname did not resolve to any address"))
}

/// Creates a non-blocking listening socket.
///
/// With `reuse_port` several listeners may be bound to the same address and
/// the kernel spreads incoming connections across them.
pub(crate) fn bind_listener(addr: SocketAddr, reuse_port: bool) -> io::Result<std::net::TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    #[cfg(not(windows))]
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    #[cfg(not(unix))]
    let _ = reuse_port;

    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

//

/// Write side of a connection.
///
/// Offers the non-suspending [`try_write`](Self::try_write) and the
/// suspending [`write`](Self::write); [`send`](Self::send) combines them so
/// that the suspending path only ever receives what the first one did not
/// accept.
pub(crate) struct ConnWriter<W> {
    io: W,
    write_timeout: Duration,
}

impl<W: AsyncWrite + Unpin> ConnWriter<W> {
    #[inline]
    pub(crate) fn new(io: W, write_timeout: Duration) -> Self {
        Self { io, write_timeout }
    }

    #[inline]
    pub(crate) fn into_inner(self) -> W {
        self.io
    }

    /// Offers `buf` to the transport once, without suspending.
    /// Returns how many bytes were accepted (possibly `0`).
    #[inline]
    pub(crate) fn try_write(&mut self, buf: &[u8]) -> Result<usize> {
        let mut cx = Context::from_waker(noop_waker_ref());

        match Pin::new(&mut self.io).poll_write(&mut cx, buf) {
            Poll::Ready(Ok(n)) => Ok(n),
            Poll::Ready(Err(err)) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Poll::Ready(Err(err)) => Err(Error::from_io(err)),
            Poll::Pending => Ok(0),
        }
    }

    /// Writes all of `buf`, suspending as needed, bounded by the write timeout.
    pub(crate) async fn write(&mut self, buf: &[u8]) -> Result<()> {
        let io = &mut self.io;
        let write = async move {
            io.write_all(buf).await?;
            io.flush().await
        };

        match timeout(self.write_timeout, write).await {
            Ok(result) => result.map_err(Error::from_io),
            Err(_) => Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "socket write timeout",
            ))),
        }
    }

    /// Fast path first, then the remainder (and only the remainder) through
    /// the suspending path.
    #[inline]
    pub(crate) async fn send(&mut self, buf: &[u8]) -> Result<()> {
        let accepted = self.try_write(buf)?;
        if accepted < buf.len() {
            log::trace!("inline write took {accepted}/{} bytes", buf.len());
        }

        self.write(&buf[accepted..]).await
    }

    /// Closes the write direction. Errors are ignored: the connection is
    /// being abandoned anyway.
    pub(crate) async fn shutdown(&mut self) {
        let _ = timeout(self.write_timeout, self.io.shutdown()).await;
    }
}

#[cfg(test)]
mod transport_tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[test]
    fn resolve() {
        #[rustfmt::skip]
        let cases = [
            ("127.0.0.1", 9000, "127.0.0.1:9000"),
            ("",          80,   "0.0.0.0:80"),
            ("[::1]",     443,  "[::1]:443"),
            ("::1",       8080, "[::1]:8080"),
        ];

        for (host, port, expected) in cases {
            assert_eq!(resolve_addr(host, port).unwrap().to_string(), expected, "{host}");
        }
    }

    #[tokio::test]
    async fn partial_inline_write_completes_without_duplication() {
        let (server, mut client) = duplex(5);
        let mut writer = ConnWriter::new(server, Duration::from_secs(1));
        let response = b"HTTP/1.1 200 OK\r\n\r\n.";
        assert_eq!(response.len(), 20);

        assert_eq!(writer.try_write(response).unwrap(), 5);

        let reader = tokio::spawn(async move {
            let mut received = Vec::new();
            client.read_to_end(&mut received).await.unwrap();
            received
        });

        writer.write(&response[5..]).await.unwrap();
        drop(writer);

        assert_eq!(reader.await.unwrap(), response);
    }

    #[tokio::test]
    async fn send_uses_both_paths() {
        let (server, mut client) = duplex(8);
        let mut writer = ConnWriter::new(server, Duration::from_secs(1));
        let payload: Vec<u8> = (0..64).collect();

        let reader = tokio::spawn(async move {
            let mut received = Vec::new();
            client.read_to_end(&mut received).await.unwrap();
            received
        });

        writer.send(&payload).await.unwrap();
        writer.shutdown().await;
        drop(writer);

        assert_eq!(reader.await.unwrap(), payload);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_path_times_out() {
        let (server, _client) = duplex(4);
        let mut writer = ConnWriter::new(server, Duration::from_millis(50));

        let err = writer.send(b"more than four bytes").await.unwrap_err();
        assert!(matches!(err, Error::Io(e) if e.kind() == io::ErrorKind::TimedOut));
    }

    #[tokio::test]
    async fn listeners_share_port() {
        let first = bind_listener("127.0.0.1:0".parse().unwrap(), true).unwrap();
        let addr = first.local_addr().unwrap();

        #[cfg(unix)]
        {
            let second = bind_listener(addr, true).unwrap();
            assert_eq!(second.local_addr().unwrap(), addr);
        }

        let listener = tokio::net::TcpListener::from_std(first).unwrap();
        let connect = tokio::net::TcpStream::connect(addr);
        let (accepted, connected) = tokio::join!(listener.accept(), connect);
        assert!(accepted.is_ok() && connected.is_ok());
    }
}
