//! The slot broker: a fixed array of backend connection slots shared by all
//! workers. A worker holds at most one slot at a time; ownership of the
//! connection moves with the borrow and comes back on return.

mod conn;
mod stream;

pub use conn::BackendConn;
pub use stream::StreamInner;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{Address, Config, Failover, User};
use crate::errors::{Error, ServerIdentifier};
use crate::stats::FAILOVER_COUNTER;

pub type SlotId = usize;

/// How a borrow is being handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckinKind {
    /// The backend reported an idle transaction state; the connection is
    /// shelved for the next borrower.
    Idle,
    /// The connection may carry protocol state we did not consume (a
    /// rollback was issued, or an error path fired); it is discarded and the
    /// slot re-establishes lazily.
    Dirty,
}

#[derive(Debug)]
enum SlotState {
    /// No connection; the next borrower establishes one.
    Empty,
    /// An established connection waiting for a borrower.
    Shelved(BackendConn),
    /// The connection is out with a worker.
    Borrowed,
}

/// One borrowed slot. Owns the backend connection and the capacity permit
/// for the duration of the borrow.
#[derive(Debug)]
pub struct Lease {
    slot: SlotId,
    conn: BackendConn,
    permit: OwnedSemaphorePermit,
}

impl Lease {
    #[inline(always)]
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    #[inline(always)]
    pub fn conn_mut(&mut self) -> &mut BackendConn {
        &mut self.conn
    }

    #[inline(always)]
    pub fn is_new(&self) -> bool {
        self.conn.is_new()
    }

    #[inline(always)]
    pub fn process_id(&self) -> i32 {
        self.conn.process_id()
    }
}

/// Settings the broker needs, snapshotted from the configuration.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub address: Address,
    pub user: User,
    pub database: String,
    pub pool_size: usize,
    pub checkout_timeout: Duration,
    pub connect_timeout: Duration,
    pub failover: Failover,
}

impl BrokerSettings {
    pub fn from_config(config: &Config) -> BrokerSettings {
        BrokerSettings {
            address: config.pool.address(),
            user: config.pool.server_user(),
            database: config.pool.database.clone(),
            pool_size: config.pool.pool_size,
            checkout_timeout: Duration::from_millis(config.general.checkout_timeout),
            connect_timeout: Duration::from_millis(config.general.connect_timeout),
            failover: config.failover.clone(),
        }
    }
}

pub struct Broker {
    slots: Vec<Mutex<SlotState>>,
    free: Arc<Semaphore>,
    settings: BrokerSettings,

    /// Flipped once a failover has been promoted; all establishes go to the
    /// standby from then on.
    failed_over: AtomicBool,
}

impl Broker {
    pub fn new(settings: BrokerSettings) -> Broker {
        let mut slots = Vec::with_capacity(settings.pool_size);
        for _ in 0..settings.pool_size {
            slots.push(Mutex::new(SlotState::Empty));
        }
        Broker {
            free: Arc::new(Semaphore::new(settings.pool_size)),
            slots,
            settings,
            failed_over: AtomicBool::new(false),
        }
    }

    /// The address new connections are established to.
    fn establish_address(&self) -> Address {
        if self.failed_over.load(Ordering::Relaxed) {
            Address {
                host: self.settings.failover.host.clone(),
                port: self.settings.failover.port,
            }
        } else {
            self.settings.address.clone()
        }
    }

    #[inline(always)]
    pub fn failover_configured(&self) -> bool {
        self.settings.failover.enabled
    }

    /// Free slots right now. For supervision and tests; racy by nature.
    pub fn available(&self) -> usize {
        self.free.available_permits()
    }

    pub fn pool_size(&self) -> usize {
        self.settings.pool_size
    }

    /// Borrow a backend connection for `(user, database)`.
    ///
    /// With `blocking` the acquire waits up to the checkout timeout for a
    /// free slot; without it an occupied pool fails immediately. An empty
    /// slot establishes its connection lazily, once more when `retry` is set
    /// and the first establish fails.
    pub async fn get_connection(
        &self,
        user: &str,
        database: &str,
        blocking: bool,
        retry: bool,
    ) -> Result<Lease, Error> {
        if user != self.settings.user.username || database != self.settings.database {
            return Err(Error::PoolExhausted(format!(
                "no pool for {user}@{database}"
            )));
        }

        let permit = if blocking {
            match tokio::time::timeout(
                self.settings.checkout_timeout,
                self.free.clone().acquire_owned(),
            )
            .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(Error::ShuttingDown),
                Err(_) => {
                    return Err(Error::PoolExhausted(format!(
                        "all {} slots busy after {:?}",
                        self.settings.pool_size, self.settings.checkout_timeout
                    )));
                }
            }
        } else {
            match self.free.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    return Err(Error::PoolExhausted(format!(
                        "all {} slots busy",
                        self.settings.pool_size
                    )));
                }
            }
        };

        // The permit guarantees an unborrowed slot exists: either one
        // holding a shelved connection, or an empty one to fill. Slots are
        // claimed under their own lock so two holders never pick the same
        // one.
        let slot = 'claim: loop {
            // Prefer an already-established connection.
            for (slot, entry) in self.slots.iter().enumerate() {
                let mut guard = entry.lock();
                if matches!(&*guard, SlotState::Shelved(_)) {
                    if let SlotState::Shelved(conn) =
                        std::mem::replace(&mut *guard, SlotState::Borrowed)
                    {
                        return Ok(Lease { slot, conn, permit });
                    }
                }
            }

            for (slot, entry) in self.slots.iter().enumerate() {
                let mut guard = entry.lock();
                if matches!(&*guard, SlotState::Empty) {
                    *guard = SlotState::Borrowed;
                    break 'claim slot;
                }
            }

            // Every slot was mid-transition under another borrower; let
            // those borrowers finish and look again.
            tokio::task::yield_now().await;
        };

        let address = self.establish_address();
        let conn = match self.establish(&address, database).await {
            Ok(conn) => conn,
            Err(err) => {
                let second_try = if retry {
                    warn!("Establish to {address} failed, retrying: {err}");
                    self.establish(&address, database).await
                } else {
                    Err(err)
                };
                match second_try {
                    Ok(conn) => conn,
                    Err(err) => {
                        *self.slots[slot].lock() = SlotState::Empty;
                        return Err(err);
                    }
                }
            }
        };

        Ok(Lease { slot, conn, permit })
    }

    /// Establish a new backend connection, bounded by the connect timeout so
    /// a half-open backend cannot hang the borrower.
    async fn establish(&self, address: &Address, database: &str) -> Result<BackendConn, Error> {
        match tokio::time::timeout(
            self.settings.connect_timeout,
            BackendConn::establish(address, &self.settings.user, database),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::ServerStartupError(
                format!(
                    "server {address} did not complete startup within {:?}",
                    self.settings.connect_timeout
                ),
                ServerIdentifier::new(&self.settings.user.username, database),
            )),
        }
    }

    /// Hand a borrow back. `Idle` shelves the connection; `Dirty` discards
    /// it so the slot re-establishes on the next acquire.
    pub fn return_connection(&self, lease: Lease, kind: CheckinKind) -> Result<(), Error> {
        let Lease {
            slot,
            mut conn,
            permit,
        } = lease;

        let mut guard = self.slots[slot].lock();
        if !matches!(&*guard, SlotState::Borrowed) {
            // Two owners of one slot means the accounting is broken.
            drop(permit);
            return Err(Error::PoolReturnFailed(format!(
                "slot {slot} was not borrowed"
            )));
        }

        match kind {
            CheckinKind::Idle if !conn.is_bad() => {
                conn.clear_new();
                *guard = SlotState::Shelved(conn);
            }
            _ => {
                info!("Discarding connection of slot {slot}");
                *guard = SlotState::Empty;
                drop(conn);
            }
        }

        drop(guard);
        drop(permit);
        Ok(())
    }

    /// Promote the standby after a write to the current backend failed.
    /// The lease stays with the caller (its teardown path returns it and the
    /// bad connection is discarded there); every future establish targets
    /// the failover address.
    pub fn server_failover(&self, lease: &mut Lease) {
        lease.conn_mut().mark_bad("failover");
        let old_address = lease.conn_mut().address().clone();
        let slot = lease.slot();
        error!(
            "Failing over from {} to {}:{} (slot {})",
            old_address,
            self.settings.failover.host,
            self.settings.failover.port,
            slot
        );

        if !self.failed_over.swap(true, Ordering::Relaxed) {
            // First promotion: drop every shelved connection to the old
            // primary so slots re-establish against the standby.
            for entry in &self.slots {
                let mut guard = entry.lock();
                if let SlotState::Shelved(_) = &*guard {
                    if let SlotState::Shelved(mut old) =
                        std::mem::replace(&mut *guard, SlotState::Empty)
                    {
                        old.mark_bad("failover");
                    }
                }
            }
        }

        FAILOVER_COUNTER.fetch_add(1, Ordering::Relaxed);
    }
}
