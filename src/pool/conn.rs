//! A single established backend connection.
//!
//! Pretends to be a PostgreSQL client for the startup exchange, then hands
//! the raw byte stream over to the relay. Only trust and cleartext-password
//! authentication are spoken here; anything stronger belongs to the
//! authentication pipeline in front of the pool.

use bytes::{Buf, BytesMut};
use log::{info, warn};
use tokio::io::AsyncReadExt;

use crate::config::{Address, User};
use crate::errors::{Error, ServerIdentifier};
use crate::messages::{
    password_message, read_message, rollback_query, startup, terminate, write_all_flush, PgErrorMsg,
};
use crate::stats::SERVER_CONNECTION_COUNTER;

use super::stream::{self, StreamInner};

/// Authentication request codes this pool understands.
const AUTHENTICATION_SUCCESSFUL: i32 = 0;
const AUTHENTICATION_CLEAR_PASSWORD: i32 = 3;

#[derive(Debug)]
pub struct BackendConn {
    stream: StreamInner,
    address: Address,

    /// Identity this connection was established under.
    username: String,
    database: String,

    /// Backend id and secret key, for query cancellation by other tooling.
    process_id: i32,
    secret_key: i32,

    /// Freshly established and never yet returned to the pool. Borrowers use
    /// this for the post-establish pacing delay.
    new: bool,

    /// Set when the connection must not be shelved back into its slot.
    bad: bool,

    connected_at: chrono::naive::NaiveDateTime,
}

impl BackendConn {
    /// Connect and authenticate, returning a connection in the
    /// ready-for-query state.
    pub async fn establish(address: &Address, user: &User, database: &str) -> Result<BackendConn, Error> {
        let server_id = ServerIdentifier::new(&user.username, database);
        let mut stream = stream::connect(address).await?;

        write_all_flush(
            &mut stream,
            &startup(&user.username, database, "pg_turnstile"),
        )
        .await?;

        let mut process_id = 0;
        let mut secret_key = 0;

        loop {
            let mut message = read_message(&mut stream).await.map_err(|err| {
                Error::ServerStartupError(format!("{err}"), server_id.clone())
            })?;
            let code = message.get_u8() as char;
            let _len = message.get_i32();

            match code {
                // Authentication request
                'R' => {
                    let auth_code = message.get_i32();
                    match auth_code {
                        AUTHENTICATION_SUCCESSFUL => (),
                        AUTHENTICATION_CLEAR_PASSWORD => {
                            let password = user.password.as_deref().ok_or_else(|| {
                                Error::ServerStartupError(
                                    "server wants password authentication, but no password is configured"
                                        .into(),
                                    server_id.clone(),
                                )
                            })?;
                            write_all_flush(&mut stream, &password_message(password)).await?;
                        }
                        _ => {
                            return Err(Error::ServerStartupError(
                                format!("unsupported authentication request {auth_code}"),
                                server_id,
                            ));
                        }
                    }
                }

                // ParameterStatus; nothing to retain, the relay is opaque.
                'S' => (),

                // BackendKeyData
                'K' => {
                    process_id = message.get_i32();
                    secret_key = message.get_i32();
                }

                // ErrorResponse
                'E' => {
                    return match PgErrorMsg::parse(&message) {
                        Ok(msg) => Err(Error::ServerStartupError(
                            format!("{} {}: {}", msg.severity, msg.code, msg.message),
                            server_id,
                        )),
                        Err(_) => Err(Error::ServerStartupError(
                            "unreadable error response".into(),
                            server_id,
                        )),
                    };
                }

                // NoticeResponse
                'N' => {
                    if let Ok(msg) = PgErrorMsg::parse(&message) {
                        info!("Server {address} startup notice: {}", msg.message);
                    }
                }

                // ReadyForQuery
                'Z' => {
                    SERVER_CONNECTION_COUNTER
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    info!("Server connection established to {address} as {}", user.username);
                    return Ok(BackendConn {
                        stream,
                        address: address.clone(),
                        username: user.username.clone(),
                        database: database.to_string(),
                        process_id,
                        secret_key,
                        new: true,
                        bad: false,
                        connected_at: chrono::offset::Utc::now().naive_utc(),
                    });
                }

                _ => {
                    return Err(Error::ServerStartupError(
                        format!("unexpected message '{code}' during startup"),
                        server_id,
                    ));
                }
            }
        }
    }

    /// Read whatever the backend has ready, appending to `buf`.
    /// Returns the number of bytes read; zero means the backend closed.
    pub async fn read_chunk(&mut self, buf: &mut BytesMut) -> Result<usize, Error> {
        buf.reserve(8192);
        self.stream.read_buf(buf).await.map_err(|err| {
            Error::ServerSocketError(format!("failed to read from server {}: {err}", self.address))
        })
    }

    /// Forward bytes to the backend verbatim.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), Error> {
        match write_all_flush(&mut self.stream, bytes).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.bad = true;
                Err(Error::ServerSocketError(format!(
                    "failed to write to server {}: {err}",
                    self.address
                )))
            }
        }
    }

    /// Issue a ROLLBACK for a transaction the client walked away from.
    /// The reply is never read; the connection is discarded afterwards.
    pub async fn write_rollback(&mut self) -> Result<(), Error> {
        self.bad = true;
        write_all_flush(&mut self.stream, &rollback_query()).await
    }

    #[inline(always)]
    pub fn is_new(&self) -> bool {
        self.new
    }

    pub fn clear_new(&mut self) {
        self.new = false;
    }

    #[inline(always)]
    pub fn is_bad(&self) -> bool {
        self.bad
    }

    pub fn mark_bad(&mut self, reason: &str) {
        warn!("Server {} marked bad: {reason}", self.address);
        self.bad = true;
    }

    #[inline(always)]
    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    #[inline(always)]
    pub fn secret_key(&self) -> i32 {
        self.secret_key
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn database(&self) -> &str {
        &self.database
    }
}

impl Drop for BackendConn {
    /// Best effort clean shutdown; the socket may not be writable.
    fn drop(&mut self) {
        if !self.bad {
            let _ = self.stream.try_write(&terminate());
        }

        let duration = chrono::offset::Utc::now().naive_utc() - self.connected_at;
        info!(
            "Server connection to {} closed, lifetime {}",
            self.address,
            crate::format_duration(&duration)
        );
    }
}
