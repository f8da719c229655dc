// Transport used for backend connections: plain TCP or a Unix socket.

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use crate::config::{get_config, Address};
use crate::errors::Error;
use crate::messages::configure_tcp_socket;

pin_project! {
    #[project = StreamInnerProj]
    #[derive(Debug)]
    pub enum StreamInner {
        Tcp {
            #[pin]
            stream: TcpStream,
        },
        Unix {
            #[pin]
            stream: UnixStream,
        },
    }
}

impl AsyncWrite for StreamInner {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, std::io::Error>> {
        match self.project() {
            StreamInnerProj::Tcp { stream } => stream.poll_write(cx, buf),
            StreamInnerProj::Unix { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        match self.project() {
            StreamInnerProj::Tcp { stream } => stream.poll_flush(cx),
            StreamInnerProj::Unix { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        match self.project() {
            StreamInnerProj::Tcp { stream } => stream.poll_shutdown(cx),
            StreamInnerProj::Unix { stream } => stream.poll_shutdown(cx),
        }
    }
}

impl AsyncRead for StreamInner {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.project() {
            StreamInnerProj::Tcp { stream } => stream.poll_read(cx, buf),
            StreamInnerProj::Unix { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl StreamInner {
    /// Non-blocking best-effort write, used on teardown paths only.
    pub fn try_write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            StreamInner::Tcp { stream } => stream.try_write(buf),
            StreamInner::Unix { stream } => stream.try_write(buf),
        }
    }
}

/// Open a transport to the backend. A host starting with `/` is taken as a
/// Unix socket directory holding `.s.PGSQL.<port>`.
pub(crate) async fn connect(address: &Address) -> Result<StreamInner, Error> {
    if address.host.starts_with('/') {
        let path = format!("{}/.s.PGSQL.{}", address.host, address.port);
        let stream = UnixStream::connect(&path).await.map_err(|err| {
            Error::SocketError(format!("could not connect to server {path}: {err}"))
        })?;
        Ok(StreamInner::Unix { stream })
    } else {
        let stream = TcpStream::connect((address.host.as_str(), address.port))
            .await
            .map_err(|err| {
                Error::SocketError(format!("could not connect to server {address}: {err}"))
            })?;
        configure_tcp_socket(&stream, &get_config().general);
        Ok(StreamInner::Tcp { stream })
    }
}
