// Wire-format helpers shared by both sides of the relay.

pub mod error;
pub mod protocol;
pub mod socket;

pub use error::PgErrorMsg;
pub use protocol::{
    authentication_ok, backend_key_data, error_message, password_message, ready_for_query,
    rollback_query, simple_query, startup, terminate, write_client_failover, write_pool_full,
};
pub use socket::{configure_tcp_socket, read_message, split_first_message, write_all_flush};

/// Upper bound on a single framed message.
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};

    use super::*;

    #[test]
    fn split_waits_for_header() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[b'Q', 0, 0]);
        assert!(split_first_message(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn split_waits_for_body() {
        let mut buf = BytesMut::new();
        buf.put(simple_query("SELECT 1"));
        let whole = buf.clone();
        buf.truncate(whole.len() - 2);
        assert!(split_first_message(&mut buf).unwrap().is_none());

        buf.put_slice(&whole[whole.len() - 2..]);
        let msg = split_first_message(&mut buf).unwrap().unwrap();
        assert_eq!(&msg[..], &whole[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn split_returns_messages_in_order() {
        let mut buf = BytesMut::new();
        buf.put(simple_query("BEGIN"));
        buf.put(simple_query("COMMIT"));
        buf.put(terminate());

        let first = split_first_message(&mut buf).unwrap().unwrap();
        assert_eq!(first[0], b'Q');
        assert_eq!(&first[5..10], b"BEGIN");
        let second = split_first_message(&mut buf).unwrap().unwrap();
        assert_eq!(&second[5..11], b"COMMIT");
        let third = split_first_message(&mut buf).unwrap().unwrap();
        assert_eq!(third[0], b'X');
        assert!(split_first_message(&mut buf).unwrap().is_none());
    }

    #[test]
    fn split_rejects_undersized_length() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[b'Q', 0, 0, 0, 3, 0]);
        assert!(split_first_message(&mut buf).is_err());
    }
}
