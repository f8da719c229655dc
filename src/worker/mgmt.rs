//! Per-worker management endpoint.
//!
//! Every worker binds its own local stream socket under the configured
//! directory and answers control messages on it. Each accepted connection
//! carries exactly one message and is then closed; no reply is ever written.

use std::path::{Path, PathBuf};

use log::debug;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};

use crate::errors::Error;

/// A client file descriptor is being handed to this worker. The descriptor
/// itself travels as ancillary data; the payload repeats it as an integer.
pub const MGMT_CLIENT_FD: i8 = 1;

/// A decoded management message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgmtMessage {
    ClientFd { slot: i32, fd: i32 },
    Unknown { id: i8, slot: i32 },
}

pub struct ManagementEndpoint {
    listener: UnixListener,
    path: PathBuf,
}

impl ManagementEndpoint {
    /// Bind the worker's management socket. The path is exclusive to this
    /// worker; an existing entry means another instance owns it and binding
    /// fails rather than stealing it.
    pub fn bind(dir: &Path, worker_id: u64) -> Result<ManagementEndpoint, Error> {
        let path = dir.join(format!(".s.{}.{}", std::process::id(), worker_id));
        let listener = UnixListener::bind(&path).map_err(|err| {
            Error::BindFailed(format!(
                "could not bind management socket {}: {err}",
                path.display()
            ))
        })?;
        debug!("Management socket bound at {}", path.display());
        Ok(ManagementEndpoint { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn accept(&self) -> std::io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    /// Stop listening and remove the filesystem entry.
    pub fn shutdown(self) {
        drop(self.listener);
        if let Err(err) = std::fs::remove_file(&self.path) {
            debug!(
                "Could not unlink management socket {}: {err}",
                self.path.display()
            );
        }
    }
}

/// Read the one message an accepted management connection carries.
///
/// Wire layout: `id (int8), slot (int32)` followed by an id-specific
/// payload. Unknown ids are reported as such; the caller logs and moves on.
pub async fn read_message(stream: &mut UnixStream) -> Result<MgmtMessage, Error> {
    let id = stream
        .read_i8()
        .await
        .map_err(|err| Error::SocketError(format!("failed to read management id: {err}")))?;
    let slot = stream
        .read_i32()
        .await
        .map_err(|err| Error::SocketError(format!("failed to read management slot: {err}")))?;

    match id {
        MGMT_CLIENT_FD => {
            let fd = stream.read_i32().await.map_err(|err| {
                Error::SocketError(format!("failed to read management payload: {err}"))
            })?;
            Ok(MgmtMessage::ClientFd { slot, fd })
        }
        _ => Ok(MgmtMessage::Unknown { id, slot }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn bind_accept_and_decode_client_fd() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = ManagementEndpoint::bind(dir.path(), 1).unwrap();
        let path = endpoint.path().to_path_buf();
        assert!(path.exists());

        let sender = tokio::spawn(async move {
            let mut stream = UnixStream::connect(&path).await.unwrap();
            stream.write_i8(MGMT_CLIENT_FD).await.unwrap();
            stream.write_i32(3).await.unwrap();
            stream.write_i32(17).await.unwrap();
        });

        let mut accepted = endpoint.accept().await.unwrap();
        let message = read_message(&mut accepted).await.unwrap();
        assert_eq!(message, MgmtMessage::ClientFd { slot: 3, fd: 17 });
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_ids_are_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = ManagementEndpoint::bind(dir.path(), 2).unwrap();
        let path = endpoint.path().to_path_buf();

        let sender = tokio::spawn(async move {
            let mut stream = UnixStream::connect(&path).await.unwrap();
            stream.write_i8(99).await.unwrap();
            stream.write_i32(0).await.unwrap();
        });

        let mut accepted = endpoint.accept().await.unwrap();
        let message = read_message(&mut accepted).await.unwrap();
        assert_eq!(message, MgmtMessage::Unknown { id: 99, slot: 0 });
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_unlinks_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = ManagementEndpoint::bind(dir.path(), 3).unwrap();
        let path = endpoint.path().to_path_buf();
        assert!(path.exists());
        endpoint.shutdown();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn path_collision_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let first = ManagementEndpoint::bind(dir.path(), 4).unwrap();
        let second = ManagementEndpoint::bind(dir.path(), 4);
        assert!(matches!(second, Err(Error::BindFailed(_))));
        first.shutdown();
    }
}
