//! Minimal frontend handshake.
//!
//! The full authentication pipeline lives in front of this pooler; what is
//! kept here is the bare exchange a v3 client needs before the relay can
//! take over: refuse TLS, accept the StartupMessage, answer trust-mode
//! AuthenticationOk and hand back the `(user, database)` pair.

use std::sync::atomic::{AtomicI32, Ordering};

use bytes::{Buf, BufMut, BytesMut};
use log::debug;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::errors::Error;
use crate::messages::{
    authentication_ok, backend_key_data, ready_for_query, write_all_flush, MAX_MESSAGE_SIZE,
};

const PROTOCOL_VERSION: i32 = 196608;
const SSL_REQUEST: i32 = 80877103;
const GSSENC_REQUEST: i32 = 80877104;
const CANCEL_REQUEST: i32 = 80877102;

/// Synthetic backend ids handed to clients; query cancellation is routed by
/// other tooling through the management socket, not by these.
static NEXT_BACKEND_ID: AtomicI32 = AtomicI32::new(1);

/// Identity the client asked for at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupIdentity {
    pub username: String,
    pub database: String,
}

/// Run the pre-relay exchange on a fresh client socket.
pub async fn handshake(stream: &mut TcpStream) -> Result<StartupIdentity, Error> {
    loop {
        let len = stream.read_i32().await.map_err(|err| {
            Error::ClientSocketError(format!("failed to read startup length: {err}"))
        })?;
        if !(8..=MAX_MESSAGE_SIZE as i32).contains(&len) {
            return Err(Error::ProtocolSyncError(format!(
                "bad startup message length {len}"
            )));
        }
        let code = stream.read_i32().await.map_err(|err| {
            Error::ClientSocketError(format!("failed to read startup code: {err}"))
        })?;

        match code {
            SSL_REQUEST | GSSENC_REQUEST => {
                // Frontend encryption is terminated upstream; decline.
                write_all_flush(stream, b"N").await?;
            }
            CANCEL_REQUEST => {
                let mut rest = vec![0u8; (len - 8) as usize];
                stream.read_exact(&mut rest).await.map_err(|err| {
                    Error::ClientSocketError(format!("failed to read cancel body: {err}"))
                })?;
                debug!("Cancel request received; not routed through this listener");
                return Err(Error::ProtocolSyncError(
                    "cancel requests are not relayed".into(),
                ));
            }
            PROTOCOL_VERSION => {
                let mut body = BytesMut::zeroed((len - 8) as usize);
                stream.read_exact(&mut body).await.map_err(|err| {
                    Error::ClientSocketError(format!("failed to read startup body: {err}"))
                })?;
                let identity = parse_startup_params(&mut body)?;

                let mut reply = BytesMut::new();
                reply.put(authentication_ok());
                reply.put(backend_key_data(
                    NEXT_BACKEND_ID.fetch_add(1, Ordering::Relaxed),
                    std::process::id() as i32,
                ));
                reply.put(ready_for_query(false));
                write_all_flush(stream, &reply).await?;

                return Ok(identity);
            }
            _ => {
                return Err(Error::ProtocolSyncError(format!(
                    "unexpected startup code {code}"
                )));
            }
        }
    }
}

/// Pull `user` and `database` out of the StartupMessage parameter list
/// (alternating nul-terminated keys and values, closed by an empty key).
fn parse_startup_params(body: &mut BytesMut) -> Result<StartupIdentity, Error> {
    let mut username = None;
    let mut database = None;

    loop {
        let key = read_cstr(body)?;
        if key.is_empty() {
            break;
        }
        let value = read_cstr(body)?;
        match key.as_str() {
            "user" => username = Some(value),
            "database" => database = Some(value),
            _ => (),
        }
    }

    let username = username.ok_or_else(|| {
        Error::ProtocolSyncError("startup message carries no user parameter".into())
    })?;
    // Like the backend, an absent database defaults to the user name.
    let database = database.unwrap_or_else(|| username.clone());
    Ok(StartupIdentity { username, database })
}

fn read_cstr(body: &mut BytesMut) -> Result<String, Error> {
    let mut out = String::new();
    while body.has_remaining() {
        let c = body.get_u8();
        if c == 0 {
            return Ok(out);
        }
        out.push(c as char);
    }
    if out.is_empty() {
        // A well-formed list ends exactly on the closing empty key.
        Ok(out)
    } else {
        Err(Error::ProtocolSyncError(
            "startup parameter is not nul-terminated".into(),
        ))
    }
}
