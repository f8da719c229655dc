// Builders for the handful of protocol messages this pooler originates.

use bytes::{BufMut, BytesMut};

use crate::errors::Error;
use crate::messages::socket::write_all_flush;

/// Create a simple query message.
pub fn simple_query(query: &str) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'Q');
    bytes.put_i32(4 + query.len() as i32 + 1);
    bytes.put_slice(query.as_bytes());
    bytes.put_u8(0);
    bytes
}

/// The query issued on a backend abandoned mid-transaction.
pub fn rollback_query() -> BytesMut {
    simple_query("ROLLBACK")
}

/// Create a Terminate message.
pub fn terminate() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(b'X');
    bytes.put_i32(4);
    bytes
}

/// Create a ready for query message.
pub fn ready_for_query(in_transaction: bool) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'Z');
    bytes.put_i32(5);
    if in_transaction {
        bytes.put_u8(b'T');
    } else {
        bytes.put_u8(b'I');
    }
    bytes
}

/// Create an AuthenticationOk message.
pub fn authentication_ok() -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'R');
    bytes.put_i32(8);
    bytes.put_i32(0);
    bytes
}

/// Create a BackendKeyData message.
pub fn backend_key_data(process_id: i32, secret_key: i32) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'K');
    bytes.put_i32(12);
    bytes.put_i32(process_id);
    bytes.put_i32(secret_key);
    bytes
}

/// Build the startup message sent to a backend.
pub fn startup(user: &str, database: &str, application_name: &str) -> BytesMut {
    let mut bytes = BytesMut::new();

    // Protocol version 3.0
    bytes.put_i32(196608);

    bytes.put(&b"user\0"[..]);
    bytes.put_slice(user.as_bytes());
    bytes.put_u8(0);

    bytes.put(&b"application_name\0"[..]);
    bytes.put_slice(application_name.as_bytes());
    bytes.put_u8(0);

    bytes.put(&b"database\0"[..]);
    bytes.put_slice(database.as_bytes());
    bytes.put_u8(0);
    bytes.put_u8(0);

    let len = bytes.len() as i32 + 4;
    let mut startup = BytesMut::with_capacity(len as usize);
    startup.put_i32(len);
    startup.put(bytes);
    startup
}

/// Create a password message ('p') carrying a cleartext password.
pub fn password_message(password: &str) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'p');
    bytes.put_i32(4 + password.len() as i32 + 1);
    bytes.put_slice(password.as_bytes());
    bytes.put_u8(0);
    bytes
}

/// Build an ErrorResponse.
pub fn error_message(message: &str, code: &str) -> BytesMut {
    let mut error = BytesMut::new();
    // Error level
    error.put_u8(b'S');
    error.put_slice(&b"FATAL\0"[..]);
    // Error level (non-translatable)
    error.put_u8(b'V');
    error.put_slice(&b"FATAL\0"[..]);

    // Error code.
    error.put_u8(b'C');
    error.put_slice(format!("{code}\0").as_bytes());

    // The short error message.
    error.put_u8(b'M');
    error.put_slice(format!("{message}\0").as_bytes());

    // No more fields follow.
    error.put_u8(0);

    let mut res = BytesMut::with_capacity(error.len() + 5);
    res.put_u8(b'E');
    res.put_i32(error.len() as i32 + 4);
    res.put(error);
    res
}

/// Tell the client no backend could be borrowed for it.
pub async fn write_pool_full<S>(stream: &mut S) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let res = error_message("connection pool is full", "53300");
    write_all_flush(stream, &res).await
}

/// Tell the client its backend went away and a standby is being promoted.
pub async fn write_client_failover<S>(stream: &mut S) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let res = error_message(
        "server connection failed, failover in progress; please reconnect",
        "08006",
    );
    write_all_flush(stream, &res).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_query_layout() {
        let bytes = simple_query("SELECT 1");
        assert_eq!(bytes[0], b'Q');
        let len = i32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        assert_eq!(len as usize, bytes.len() - 1);
        assert_eq!(&bytes[5..13], b"SELECT 1");
        assert_eq!(bytes[13], 0);
    }

    #[test]
    fn rollback_is_a_simple_query() {
        let bytes = rollback_query();
        assert_eq!(bytes[0], b'Q');
        assert_eq!(&bytes[5..13], b"ROLLBACK");
    }

    #[test]
    fn terminate_layout() {
        assert_eq!(&terminate()[..], &[b'X', 0, 0, 0, 4]);
    }

    #[test]
    fn ready_for_query_states() {
        assert_eq!(ready_for_query(false)[5], b'I');
        assert_eq!(ready_for_query(true)[5], b'T');
    }

    #[test]
    fn error_message_is_self_describing() {
        let bytes = error_message("pool is full", "53300");
        assert_eq!(bytes[0], b'E');
        let len = i32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        assert_eq!(len as usize, bytes.len() - 1);

        let msg = crate::messages::PgErrorMsg::parse(&bytes[5..]).unwrap();
        assert_eq!(msg.severity, "FATAL");
        assert_eq!(msg.code, "53300");
        assert_eq!(msg.message, "pool is full");
    }

    #[test]
    fn startup_carries_parameters() {
        let bytes = startup("app", "orders", "pg_turnstile");
        let len = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len());
        let body = &bytes[8..];
        let text = String::from_utf8_lossy(body);
        assert!(text.contains("user\0app\0"));
        assert!(text.contains("database\0orders\0"));
    }
}
