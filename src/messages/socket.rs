// Socket-level helpers shared by the client and backend sides of the relay.

use std::time::Duration;

use bytes::BytesMut;
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::General;
use crate::errors::Error;
use crate::messages::MAX_MESSAGE_SIZE;

/// Write everything and flush.
pub async fn write_all_flush<S>(stream: &mut S, buf: &[u8]) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    stream
        .write_all(buf)
        .await
        .map_err(|err| Error::SocketError(format!("failed to write to socket: {err}")))?;
    stream
        .flush()
        .await
        .map_err(|err| Error::SocketError(format!("failed to flush socket: {err}")))
}

/// Split one complete tagged message off the front of an accumulation buffer.
///
/// Post-startup messages are `tag (1) + length (4, includes itself) + body`.
/// Returns `Ok(None)` until the whole message has arrived; the caller keeps
/// appending reads to `buf` and retrying.
pub fn split_first_message(buf: &mut BytesMut) -> Result<Option<BytesMut>, Error> {
    if buf.len() < 5 {
        return Ok(None);
    }

    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len < 4 {
        return Err(Error::ProtocolSyncError(format!(
            "message length {len} is smaller than the length field itself"
        )));
    }
    if len as usize > MAX_MESSAGE_SIZE {
        return Err(Error::ProtocolSyncError(format!(
            "message length {len} exceeds the {MAX_MESSAGE_SIZE} byte limit"
        )));
    }

    let total = 1 + len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some(buf.split_to(total)))
}

/// Read one complete tagged message (header + body).
pub async fn read_message<S>(stream: &mut S) -> Result<BytesMut, Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let mut header = [0u8; 5];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|err| Error::SocketError(format!("failed to read message header: {err}")))?;

    let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if len < 4 || len as usize > MAX_MESSAGE_SIZE {
        return Err(Error::ProtocolSyncError(format!(
            "bad message length {len} for tag '{}'",
            header[0] as char
        )));
    }

    let mut message = BytesMut::with_capacity(1 + len as usize);
    message.extend_from_slice(&header);
    message.resize(1 + len as usize, 0);
    stream
        .read_exact(&mut message[5..])
        .await
        .map_err(|err| Error::SocketError(format!("failed to read message body: {err}")))?;

    Ok(message)
}

/// Apply keepalive and nodelay settings to an accepted or dialed TCP socket.
pub fn configure_tcp_socket(stream: &TcpStream, general: &General) {
    let sock_ref = SockRef::from(stream);

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(general.tcp_keepalives_idle))
        .with_interval(Duration::from_secs(general.tcp_keepalives_interval))
        .with_retries(general.tcp_keepalives_count);
    if let Err(err) = sock_ref.set_tcp_keepalive(&keepalive) {
        log::warn!("Could not configure TCP keepalive: {err}");
    }
    if let Err(err) = stream.set_nodelay(general.tcp_no_delay) {
        log::warn!("Could not configure TCP nodelay: {err}");
    }
}
