//! End-to-end exercises of the pipeline: a scripted PostgreSQL backend on a
//! localhost listener, a duplex pipe standing in for the client socket, and
//! a real broker in between.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{duplex, split, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::config::{Address, Failover, User};
use crate::messages::{
    authentication_ok, backend_key_data, error_message, ready_for_query, simple_query, terminate,
    PgErrorMsg,
};
use crate::pool::{Broker, BrokerSettings, CheckinKind};
use crate::stats::FAILOVER_COUNTER;
use crate::worker::{Termination, Worker};

fn settings(port: u16, pool_size: usize, failover_port: Option<u16>) -> BrokerSettings {
    BrokerSettings {
        address: Address {
            host: "127.0.0.1".into(),
            port,
        },
        user: User {
            username: "app".into(),
            password: None,
        },
        database: "orders".into(),
        pool_size,
        checkout_timeout: Duration::from_millis(200),
        connect_timeout: Duration::from_secs(2),
        failover: match failover_port {
            Some(port) => Failover {
                enabled: true,
                host: "127.0.0.1".into(),
                port,
            },
            None => Failover::default(),
        },
    }
}

/// Server side of the trust startup exchange.
async fn accept_backend_startup(stream: &mut TcpStream) {
    let len = stream.read_i32().await.unwrap();
    let mut body = vec![0u8; (len - 4) as usize];
    stream.read_exact(&mut body).await.unwrap();

    let mut reply = BytesMut::new();
    reply.put(authentication_ok());
    reply.put(backend_key_data(4242, 1));
    reply.put(ready_for_query(false));
    stream.write_all(&reply).await.unwrap();
}

/// Read one tagged message off any stream.
async fn read_framed<S>(stream: &mut S) -> BytesMut
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await.unwrap();
    let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let mut message = BytesMut::with_capacity(1 + len);
    message.extend_from_slice(&header);
    message.resize(1 + len, 0);
    stream.read_exact(&mut message[5..]).await.unwrap();
    message
}

fn command_complete(tag: &str) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'C');
    bytes.put_i32(4 + tag.len() as i32 + 1);
    bytes.put_slice(tag.as_bytes());
    bytes.put_u8(0);
    bytes
}

fn row_description_stub() -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'T');
    bytes.put_i32(4 + 2);
    bytes.put_i16(0);
    bytes
}

/// An ErrorResponse with a caller-chosen severity, unlike the FATAL-only
/// builder the pooler uses for its own notices.
fn error_response(severity: &str, code: &str, message: &str) -> BytesMut {
    let mut fields = BytesMut::new();
    for (tag, value) in [
        (b'S', severity),
        (b'V', severity),
        (b'C', code),
        (b'M', message),
    ] {
        fields.put_u8(tag);
        fields.put_slice(value.as_bytes());
        fields.put_u8(0);
    }
    fields.put_u8(0);

    let mut bytes = BytesMut::with_capacity(fields.len() + 5);
    bytes.put_u8(b'E');
    bytes.put_i32(fields.len() as i32 + 4);
    bytes.put(fields);
    bytes
}

async fn wait_available(broker: &Arc<Broker>, want: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if broker.available() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("pool never reached the expected availability");
}

/// Build a worker around a fresh duplex "client" and run it.
async fn spawn_worker(
    broker: &Arc<Broker>,
    dir: &tempfile::TempDir,
) -> (DuplexStream, JoinHandle<Termination>) {
    let (client_end, worker_end) = duplex(64 * 1024);
    let initial = broker
        .get_connection("app", "orders", true, true)
        .await
        .unwrap();
    let (read, write) = split(worker_end);
    let worker = Worker::new(
        read,
        write,
        "test-client".into(),
        broker.clone(),
        dir.path().to_path_buf(),
    );
    (client_end, tokio::spawn(worker.run(initial)))
}

#[tokio::test]
async fn simple_query_roundtrip_returns_the_slot() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let backend = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        accept_backend_startup(&mut stream).await;

        let query = read_framed(&mut stream).await;
        assert_eq!(query[0], b'Q');
        assert_eq!(&query[5..14], b"SELECT 1;");

        let mut reply = BytesMut::new();
        reply.put(row_description_stub());
        reply.put(command_complete("SELECT 1"));
        reply.put(ready_for_query(false));
        stream.write_all(&reply).await.unwrap();

        // Hold the socket so the shelved connection stays healthy.
        let mut hold = [0u8; 1];
        let _ = stream.read(&mut hold).await;
    });

    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(Broker::new(settings(port, 1, None)));
    let (mut client, handle) = spawn_worker(&broker, &dir).await;

    client.write_all(&simple_query("SELECT 1;")).await.unwrap();

    assert_eq!(read_framed(&mut client).await[0], b'T');
    assert_eq!(read_framed(&mut client).await[0], b'C');
    let ready = read_framed(&mut client).await;
    assert_eq!(ready[0], b'Z');
    assert_eq!(ready[5], b'I');

    // Idle state observed: the slot goes home while the client stays.
    wait_available(&broker, 1).await;

    client.write_all(&terminate()).await.unwrap();
    assert_eq!(handle.await.unwrap(), Termination::Success);
    assert!(crate::stats::termination_count(Termination::Success) >= 1);
    backend.abort();
}

#[tokio::test]
async fn client_disconnect_mid_transaction_rolls_back() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let backend = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        accept_backend_startup(&mut stream).await;

        let begin = read_framed(&mut stream).await;
        assert_eq!(&begin[5..10], b"BEGIN");
        let mut reply = BytesMut::new();
        reply.put(command_complete("BEGIN"));
        reply.put(ready_for_query(true));
        stream.write_all(&reply).await.unwrap();

        let update = read_framed(&mut stream).await;
        assert_eq!(update[0], b'Q');
        let mut reply = BytesMut::new();
        reply.put(command_complete("UPDATE 1"));
        reply.put(ready_for_query(true));
        stream.write_all(&reply).await.unwrap();

        // The client vanishes; the worker must roll the transaction back.
        let rollback = read_framed(&mut stream).await;
        assert_eq!(rollback[0], b'Q');
        assert_eq!(&rollback[5..13], b"ROLLBACK");
    });

    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(Broker::new(settings(port, 1, None)));
    let (mut client, handle) = spawn_worker(&broker, &dir).await;

    client.write_all(&simple_query("BEGIN")).await.unwrap();
    assert_eq!(read_framed(&mut client).await[0], b'C');
    let ready = read_framed(&mut client).await;
    assert_eq!(ready[5], b'T');

    // In transaction: the borrow is retained.
    assert_eq!(broker.available(), 0);

    client
        .write_all(&simple_query("UPDATE t SET x = 1;"))
        .await
        .unwrap();
    assert_eq!(read_framed(&mut client).await[0], b'C');
    assert_eq!(read_framed(&mut client).await[5], b'T');

    // Still in transaction after the second statement.
    assert_eq!(broker.available(), 0);

    drop(client);
    assert_eq!(handle.await.unwrap(), Termination::ClientFailure);
    backend.await.unwrap();

    // Rolled back and returned; the dirty connection was discarded.
    wait_available(&broker, 1).await;
}

#[tokio::test]
async fn error_response_parks_the_borrow_until_rollback() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let backend = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        accept_backend_startup(&mut stream).await;

        let begin = read_framed(&mut stream).await;
        assert_eq!(&begin[5..10], b"BEGIN");
        let mut reply = BytesMut::new();
        reply.put(command_complete("BEGIN"));
        reply.put(ready_for_query(true));
        stream.write_all(&reply).await.unwrap();

        let _bad = read_framed(&mut stream).await;
        // ErrorResponse and the failed-transaction ReadyForQuery arrive in
        // one write.
        let mut reply = BytesMut::new();
        reply.put(error_response("ERROR", "42703", "column does not exist"));
        reply.put_slice(&[b'Z', 0, 0, 0, 5, b'E']);
        stream.write_all(&reply).await.unwrap();

        let rollback = read_framed(&mut stream).await;
        assert_eq!(&rollback[5..13], b"ROLLBACK");
        let mut reply = BytesMut::new();
        reply.put(command_complete("ROLLBACK"));
        reply.put(ready_for_query(false));
        stream.write_all(&reply).await.unwrap();

        let mut hold = [0u8; 1];
        let _ = stream.read(&mut hold).await;
    });

    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(Broker::new(settings(port, 1, None)));
    let (mut client, handle) = spawn_worker(&broker, &dir).await;

    client.write_all(&simple_query("BEGIN")).await.unwrap();
    assert_eq!(read_framed(&mut client).await[0], b'C');
    assert_eq!(read_framed(&mut client).await[5], b'T');

    client
        .write_all(&simple_query("SELECT missing;"))
        .await
        .unwrap();
    let error = read_framed(&mut client).await;
    assert_eq!(error[0], b'E');
    assert!(!PgErrorMsg::parse(&error[5..]).unwrap().is_fatal());
    let ready = read_framed(&mut client).await;
    assert_eq!(ready[5], b'E');

    // The ErrorResponse suppresses the return even though more messages
    // followed it in the same buffer.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.available(), 0);

    client.write_all(&simple_query("ROLLBACK")).await.unwrap();
    assert_eq!(read_framed(&mut client).await[0], b'C');
    assert_eq!(read_framed(&mut client).await[5], b'I');
    wait_available(&broker, 1).await;

    client.write_all(&terminate()).await.unwrap();
    assert_eq!(handle.await.unwrap(), Termination::Success);
    backend.abort();
}

#[tokio::test]
async fn backend_write_failure_triggers_failover() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let backend = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        accept_backend_startup(&mut stream).await;
        // Slam the door with an RST so the next relay write fails fast.
        {
            let sock = socket2::SockRef::from(&stream);
            sock.set_linger(Some(Duration::from_secs(0))).unwrap();
        }
        drop(stream);
    });

    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(Broker::new(settings(port, 1, Some(port))));
    let (mut client, handle) = spawn_worker(&broker, &dir).await;

    backend.await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let before = FAILOVER_COUNTER.load(Ordering::Relaxed);
    client.write_all(&simple_query("SELECT 1;")).await.unwrap();

    let notice = read_framed(&mut client).await;
    assert_eq!(notice[0], b'E');
    let msg = PgErrorMsg::parse(&notice[5..]).unwrap();
    assert_eq!(msg.code, "08006");

    assert_eq!(handle.await.unwrap(), Termination::Failover);
    assert!(FAILOVER_COUNTER.load(Ordering::Relaxed) > before);
    wait_available(&broker, 1).await;
}

#[tokio::test]
async fn fatal_error_response_terminates_the_worker() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let backend = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        accept_backend_startup(&mut stream).await;

        let _query = read_framed(&mut stream).await;
        stream
            .write_all(&error_message(
                "terminating connection due to administrator command",
                "57P01",
            ))
            .await
            .unwrap();

        let mut hold = [0u8; 1];
        let _ = stream.read(&mut hold).await;
    });

    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(Broker::new(settings(port, 1, None)));
    let (mut client, handle) = spawn_worker(&broker, &dir).await;

    client.write_all(&simple_query("SELECT 1;")).await.unwrap();

    // The fatal message still reaches the client before the worker dies.
    let error = read_framed(&mut client).await;
    assert_eq!(error[0], b'E');
    assert!(PgErrorMsg::parse(&error[5..]).unwrap().is_fatal());

    assert_eq!(handle.await.unwrap(), Termination::ServerFatal);
    wait_available(&broker, 1).await;
    backend.abort();
}

#[tokio::test]
async fn pool_exhaustion_reports_pool_full() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let backend = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        accept_backend_startup(&mut stream).await;
        let mut hold = [0u8; 1];
        let _ = stream.read(&mut hold).await;
    });

    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(Broker::new(settings(port, 1, None)));
    let (mut client, handle) = spawn_worker(&broker, &dir).await;

    // Someone else takes the only slot.
    let hog = broker
        .get_connection("app", "orders", true, true)
        .await
        .unwrap();

    client.write_all(&simple_query("SELECT 1;")).await.unwrap();

    let notice = read_framed(&mut client).await;
    assert_eq!(notice[0], b'E');
    let msg = PgErrorMsg::parse(&notice[5..]).unwrap();
    assert_eq!(msg.code, "53300");

    assert_eq!(handle.await.unwrap(), Termination::ServerFailure);

    broker.return_connection(hog, CheckinKind::Idle).unwrap();
    wait_available(&broker, 1).await;
    backend.abort();
}

#[tokio::test]
async fn fragmented_backend_reply_is_relayed_verbatim() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let row_body: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let expected_body = row_body.clone();

    let backend = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        accept_backend_startup(&mut stream).await;

        let _query = read_framed(&mut stream).await;

        let mut reply = BytesMut::new();
        reply.put_u8(b'D');
        reply.put_i32(4 + row_body.len() as i32);
        reply.put_slice(&row_body);
        reply.put(command_complete("SELECT 1"));
        reply.put(ready_for_query(false));

        // Dribble the reply out so the relay sees many partial reads.
        for chunk in reply.chunks(257) {
            stream.write_all(chunk).await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let mut hold = [0u8; 1];
        let _ = stream.read(&mut hold).await;
    });

    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(Broker::new(settings(port, 1, None)));
    let (mut client, handle) = spawn_worker(&broker, &dir).await;

    client.write_all(&simple_query("SELECT 1;")).await.unwrap();

    let row = read_framed(&mut client).await;
    assert_eq!(row[0], b'D');
    assert_eq!(&row[5..], &expected_body[..]);
    assert_eq!(read_framed(&mut client).await[0], b'C');
    assert_eq!(read_framed(&mut client).await[5], b'I');

    wait_available(&broker, 1).await;

    client.write_all(&terminate()).await.unwrap();
    assert_eq!(handle.await.unwrap(), Termination::Success);
    backend.abort();
}

#[tokio::test]
async fn management_socket_lifecycle() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let backend = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        accept_backend_startup(&mut stream).await;
        let mut hold = [0u8; 1];
        let _ = stream.read(&mut hold).await;
    });

    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(Broker::new(settings(port, 1, None)));
    let (mut client, handle) = spawn_worker(&broker, &dir).await;

    // The worker's management socket shows up in the directory.
    let path = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(entry) = std::fs::read_dir(dir.path()).unwrap().flatten().next() {
                return entry.path();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("management socket never appeared");

    // An unknown control message is consumed and ignored.
    let mut mgmt = tokio::net::UnixStream::connect(&path).await.unwrap();
    mgmt.write_i8(99).await.unwrap();
    mgmt.write_i32(0).await.unwrap();
    drop(mgmt);

    tokio::time::sleep(Duration::from_millis(50)).await;

    // The worker is still fully operational afterwards.
    client.write_all(&terminate()).await.unwrap();
    assert_eq!(handle.await.unwrap(), Termination::Success);

    // Termination unlinked the socket.
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    backend.abort();
}
