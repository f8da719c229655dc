//! The per-client transaction pipeline.
//!
//! One worker serves one client connection for its lifetime. A backend is
//! borrowed from the pool only while a transaction (or a standalone
//! statement) is in flight: the borrow happens on the first client message
//! after an idle period, and the backend goes home as soon as its
//! ReadyForQuery reports the idle state. In between, the worker is a
//! byte-level relay that never rewrites a message.

pub mod framing;
pub mod mgmt;

#[cfg(test)]
mod tests;

use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, error, info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;

use crate::errors::Error;
use crate::messages::{
    split_first_message, write_all_flush, write_client_failover, write_pool_full, PgErrorMsg,
};
use crate::pool::{Broker, CheckinKind, Lease, SlotId};
use crate::stats::record_termination;
use crate::worker::framing::FramingTracker;
use crate::worker::mgmt::{ManagementEndpoint, MgmtMessage};

/// Distinguishes the worker's management sockets within one process.
static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(0);

/// Delay absorbing the pool-initializer race on a just-established backend.
const NEW_CONNECTION_PACING: Duration = Duration::from_millis(5);

/// Why the worker's event loop exited. Reported to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Clean client-initiated close (Terminate message).
    Success = 0,
    /// Client socket error, or the client vanished without a Terminate.
    ClientFailure = 1,
    /// Backend socket error, pool exhaustion, or a failed slot return.
    ServerFailure = 2,
    /// The backend sent a FATAL or PANIC ErrorResponse.
    ServerFatal = 3,
    /// A backend write failed and the standby was promoted.
    Failover = 4,
    /// The worker could not start (management socket bind).
    WorkerFailure = 5,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::Success => "success",
            Termination::ClientFailure => "client failure",
            Termination::ServerFailure => "server failure",
            Termination::ServerFatal => "server fatal",
            Termination::Failover => "failover",
            Termination::WorkerFailure => "worker failure",
        }
    }
}

impl Display for Termination {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Worker<R, W> {
    client_read: R,
    client_write: W,

    /// Client address, for logs only.
    addr: String,

    /// Snapshotted from the initial slot at start; every later borrow uses
    /// the same pair.
    username: String,
    database: String,

    broker: Arc<Broker>,
    unix_socket_dir: PathBuf,
    worker_id: u64,
    mgmt: Option<ManagementEndpoint>,

    /// The currently borrowed backend, if any.
    lease: Option<Lease>,

    /// Whether backend readability is being watched. Cleared while an
    /// ErrorResponse is parked with the client, set again on borrow and on
    /// the next client message over the held backend.
    watch_server: bool,

    tracker: FramingTracker,
    client_buf: BytesMut,
    server_buf: BytesMut,
    termination: Option<Termination>,
    started_at: chrono::naive::NaiveDateTime,
}

impl<R, W> Worker<R, W>
where
    R: tokio::io::AsyncRead + std::marker::Unpin,
    W: tokio::io::AsyncWrite + std::marker::Unpin,
{
    pub fn new(
        client_read: R,
        client_write: W,
        addr: String,
        broker: Arc<Broker>,
        unix_socket_dir: PathBuf,
    ) -> Worker<R, W> {
        Worker {
            client_read,
            client_write,
            addr,
            username: String::new(),
            database: String::new(),
            broker,
            unix_socket_dir,
            worker_id: NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed),
            mgmt: None,
            lease: None,
            watch_server: false,
            tracker: FramingTracker::new(),
            client_buf: BytesMut::with_capacity(8192),
            server_buf: BytesMut::with_capacity(8192),
            termination: None,
            started_at: chrono::offset::Utc::now().naive_utc(),
        }
    }

    /// Drive the pipeline to completion and report how it ended.
    pub async fn run(mut self, initial: Lease) -> Termination {
        if let Err(err) = self.start(initial).await {
            error!("Worker for client {} failed to start: {err}", self.addr);
            self.termination = Some(Termination::WorkerFailure);
        }

        let termination = match self.termination {
            Some(termination) => termination,
            None => self.event_loop().await,
        };

        self.stop().await;

        let duration = chrono::offset::Utc::now().naive_utc() - self.started_at;
        info!(
            "Client {} disconnected: {} (session {})",
            self.addr,
            termination,
            crate::format_duration(&duration)
        );
        record_termination(termination);
        termination
    }

    /// Snapshot identity off the initial slot, bind the management socket
    /// and give the slot back; the loop re-borrows on the first message.
    async fn start(&mut self, mut initial: Lease) -> Result<(), Error> {
        self.username = initial.conn_mut().username().to_string();
        self.database = initial.conn_mut().database().to_string();

        match ManagementEndpoint::bind(&self.unix_socket_dir, self.worker_id) {
            Ok(endpoint) => self.mgmt = Some(endpoint),
            Err(err) => {
                let _ = self
                    .broker
                    .return_connection(initial, CheckinKind::Dirty);
                return Err(err);
            }
        }

        let is_new = initial.is_new();
        if let Err(err) = self.broker.return_connection(initial, CheckinKind::Idle) {
            warn!("Could not return the initial slot: {err}");
        }

        if is_new {
            tokio::time::sleep(NEW_CONNECTION_PACING).await;
        }

        Ok(())
    }

    fn slot_id(&self) -> Option<SlotId> {
        self.lease.as_ref().map(|lease| lease.slot())
    }

    async fn event_loop(&mut self) -> Termination {
        loop {
            // Serve complete client messages already buffered before
            // sleeping on readiness again.
            loop {
                if self.termination.is_some() {
                    break;
                }
                match split_first_message(&mut self.client_buf) {
                    Ok(Some(message)) => self.on_client_message(message).await,
                    Ok(None) => break,
                    Err(err) => {
                        warn!("[C] Client error: {err} (client {})", self.addr);
                        self.termination = Some(Termination::ClientFailure);
                    }
                }
            }
            if let Some(termination) = self.termination {
                return termination;
            }

            let server_armed = self.lease.is_some() && self.watch_server;
            tokio::select! {
                result = self.client_read.read_buf(&mut self.client_buf) => match result {
                    Ok(0) => {
                        debug!("Client {} closed the connection", self.addr);
                        self.termination = Some(Termination::ClientFailure);
                    }
                    Ok(_) => (),
                    Err(err) => {
                        warn!(
                            "[C] Client error: {err} (slot {:?} client {})",
                            self.slot_id(),
                            self.addr
                        );
                        self.termination = Some(Termination::ClientFailure);
                    }
                },
                result = read_server_chunk(&mut self.lease, &mut self.server_buf), if server_armed => {
                    self.on_server_chunk(result).await;
                }
                result = accept_mgmt(&mut self.mgmt) => {
                    self.on_mgmt_connection(result).await;
                }
            }

            if let Some(termination) = self.termination {
                return termination;
            }
        }
    }

    /// Client → backend path: borrow on demand, forward verbatim, escalate
    /// write failures.
    async fn on_client_message(&mut self, message: BytesMut) {
        if self.lease.is_none() {
            match self
                .broker
                .get_connection(&self.username, &self.database, true, true)
                .await
            {
                Ok(lease) => {
                    debug!(
                        "Client {} borrowed slot {} (server pid {})",
                        self.addr,
                        lease.slot(),
                        lease.process_id()
                    );
                    self.lease = Some(lease);
                    self.watch_server = true;
                }
                Err(err) => {
                    warn!("Failure during obtaining connection: {err}");
                    let _ = write_pool_full(&mut self.client_write).await;
                    self.termination = Some(Termination::ServerFailure);
                    return;
                }
            }
        }

        if message[0] == b'X' {
            // Graceful close; stop() releases whatever is held.
            self.termination = Some(Termination::Success);
            return;
        }

        // A held backend is watched again as soon as the client talks to it.
        self.watch_server = true;

        let Some(lease) = self.lease.as_mut() else {
            return;
        };
        if let Err(err) = lease.conn_mut().send(&message).await {
            warn!(
                "[C] Server error: {err} (slot {:?} client {})",
                lease.slot(),
                self.addr
            );
            if self.broker.failover_configured() {
                self.broker.server_failover(lease);
                let _ = write_client_failover(&mut self.client_write).await;
                self.termination = Some(Termination::Failover);
            } else {
                self.termination = Some(Termination::ServerFailure);
            }
        }
    }

    /// Backend → client path: track framing, forward verbatim, then decide
    /// whether the backend goes home.
    async fn on_server_chunk(&mut self, result: Result<usize, Error>) {
        match result {
            Ok(0) => {
                warn!(
                    "[S] Server closed the connection (slot {:?} client {})",
                    self.slot_id(),
                    self.addr
                );
                self.termination = Some(Termination::ServerFailure);
                self.server_buf.clear();
                return;
            }
            Err(err) => {
                warn!(
                    "[S] Server error: {err} (slot {:?} client {})",
                    self.slot_id(),
                    self.addr
                );
                self.termination = Some(Termination::ServerFailure);
                self.server_buf.clear();
                return;
            }
            Ok(_) => (),
        }

        // The first byte is a tag only when the previous read ended on a
        // message boundary.
        let buffer_tag = if self.tracker.at_message_boundary() {
            self.server_buf.first().copied()
        } else {
            None
        };

        let saw_ready = self.tracker.scan(&self.server_buf);

        if let Err(err) = write_all_flush(&mut self.client_write, &self.server_buf).await {
            warn!(
                "[S] Client error: {err} (slot {:?} client {})",
                self.slot_id(),
                self.addr
            );
            self.termination = Some(Termination::ClientFailure);
            self.server_buf.clear();
            return;
        }

        if buffer_tag == Some(b'E') {
            // Keep the borrow so the client observes the error in the same
            // transaction state; stop watching until it reacts.
            self.watch_server = false;

            if let Ok(msg) = PgErrorMsg::parse(error_payload(&self.server_buf)) {
                if msg.is_fatal() {
                    error!(
                        "Server {} {}: {} (slot {:?} client {})",
                        msg.severity,
                        msg.code,
                        msg.message,
                        self.slot_id(),
                        self.addr
                    );
                    if let Some(lease) = self.lease.as_mut() {
                        lease.conn_mut().mark_bad("fatal error response");
                    }
                    self.termination = Some(Termination::ServerFatal);
                }
            }
        } else if saw_ready && !self.tracker.in_tx() && self.tracker.at_message_boundary() {
            // The backend signalled idleness and the buffer ended cleanly on
            // a message boundary; nothing of the reply is still in flight.
            if let Some(lease) = self.lease.take() {
                self.watch_server = false;
                debug!("Client {} returning slot {}", self.addr, lease.slot());
                if let Err(err) = self.broker.return_connection(lease, CheckinKind::Idle) {
                    error!("Failure during connection return: {err}");
                    self.termination = Some(Termination::ServerFailure);
                }
            }
        }

        self.server_buf.clear();
    }

    async fn on_mgmt_connection(&mut self, result: std::io::Result<UnixStream>) {
        match result {
            Ok(mut stream) => match mgmt::read_message(&mut stream).await {
                Ok(MgmtMessage::ClientFd { slot, fd }) => {
                    debug!("Management client file descriptor: slot {slot} fd {fd}");
                }
                Ok(MgmtMessage::Unknown { id, slot }) => {
                    debug!("Unsupported management id {id} (slot {slot})");
                }
                Err(err) => debug!("Management connection error: {err}"),
            },
            Err(err) => debug!("Management accept failed: {err}"),
        }
        // The connection is dropped here; one message per accept.
    }

    /// Runs exactly once on the way out, whatever ended the loop. Rolls back
    /// an abandoned transaction, releases the slot, shuts the management
    /// endpoint down.
    async fn stop(&mut self) {
        if let Some(mut lease) = self.lease.take() {
            self.watch_server = false;
            let kind = if self.tracker.in_tx() {
                if let Err(err) = lease.conn_mut().write_rollback().await {
                    warn!("Could not roll back slot {}: {err}", lease.slot());
                }
                CheckinKind::Dirty
            } else {
                CheckinKind::Idle
            };
            if let Err(err) = self.broker.return_connection(lease, kind) {
                error!("Failure during connection return: {err}");
            }
        }

        if let Some(endpoint) = self.mgmt.take() {
            endpoint.shutdown();
        }
    }
}

/// Payload of the ErrorResponse a backend buffer starts with, clamped to the
/// bytes present in this read.
fn error_payload(buf: &[u8]) -> &[u8] {
    if buf.len() < 5 {
        return &[];
    }
    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    let end = (1 + len).min(buf.len());
    &buf[5.min(end)..end]
}

async fn read_server_chunk(
    lease: &mut Option<Lease>,
    buf: &mut BytesMut,
) -> Result<usize, Error> {
    match lease.as_mut() {
        Some(lease) => lease.conn_mut().read_chunk(buf).await,
        // Only reachable when the select guard is off; parks forever.
        None => std::future::pending().await,
    }
}

async fn accept_mgmt(mgmt: &mut Option<ManagementEndpoint>) -> std::io::Result<UnixStream> {
    match mgmt.as_ref() {
        Some(endpoint) => endpoint.accept().await,
        None => std::future::pending().await,
    }
}
