//! The supervisor: listens for clients, runs the handshake, and spawns one
//! worker task per connection.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::io::split;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal as unix_signal, SignalKind};

use crate::app::startup;
use crate::config::get_config;
use crate::errors::Error;
use crate::messages::configure_tcp_socket;
use crate::pool::{Broker, BrokerSettings};
use crate::stats::TOTAL_CONNECTION_COUNTER;
use crate::worker::Worker;

pub async fn run() -> Result<(), Error> {
    let config = get_config();
    config.show();

    let broker = Arc::new(Broker::new(BrokerSettings::from_config(&config)));
    let unix_socket_dir = PathBuf::from(&config.general.unix_socket_dir);

    let listen = format!("{}:{}", config.general.host, config.general.port);
    let listener = TcpListener::bind(&listen)
        .await
        .map_err(|err| Error::BindFailed(format!("could not bind {listen}: {err}")))?;
    info!("Accepting clients on {listen}");

    let mut sigterm = unix_signal(SignalKind::terminate())
        .map_err(|err| Error::SocketError(format!("could not install SIGTERM handler: {err}")))?;
    let mut sigint = unix_signal(SignalKind::interrupt())
        .map_err(|err| Error::SocketError(format!("could not install SIGINT handler: {err}")))?;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("Accept failed: {err}");
                        continue;
                    }
                };
                TOTAL_CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
                configure_tcp_socket(&stream, &config.general);

                let broker = broker.clone();
                let unix_socket_dir = unix_socket_dir.clone();
                tokio::spawn(async move {
                    serve_client(stream, addr.to_string(), broker, unix_socket_dir).await;
                });
            }
            _ = sigterm.recv() => {
                info!("Got SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("Got SIGINT, shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn serve_client(
    mut stream: tokio::net::TcpStream,
    addr: String,
    broker: Arc<Broker>,
    unix_socket_dir: PathBuf,
) {
    let identity = match startup::handshake(&mut stream).await {
        Ok(identity) => identity,
        Err(err) => {
            warn!("Client {addr} rejected during startup: {err}");
            return;
        }
    };
    info!(
        "Client {addr} connected as {}@{}",
        identity.username, identity.database
    );

    // The worker is handed an already-borrowed slot; it returns it right
    // away and re-borrows on the first real message. This pins the identity
    // against the pool before any traffic flows.
    let initial = match broker
        .get_connection(&identity.username, &identity.database, true, true)
        .await
    {
        Ok(lease) => lease,
        Err(err) => {
            error!("Client {addr} has no usable pool: {err}");
            let _ = crate::messages::write_pool_full(&mut stream).await;
            return;
        }
    };

    let (read, write) = split(stream);
    let worker = Worker::new(read, write, addr, broker, unix_socket_dir);
    worker.run(initial).await;
}
