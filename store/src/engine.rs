//! The engine module is the main interface to the store. It manages the open/close lifecycle
//! and turns simple put/get/delete calls into batches against the [`BatchWriter`].

use crate::{
    batch::{Batch, BatchWriter},
    config::StoreConfig,
    entry::{Contract, Entry, MessageId, Timestamp},
    error::{Error, Result},
    id::IdGenerator,
    index::IndexKey,
    MAX_RESULTS,
};
use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// The name the engine goes by in an [`AdapterRegistry`][crate::adapter::AdapterRegistry].
pub const ENGINE_NAME: &str = "tidepool";

/// A [`Batch`] handed out by [`Engine::begin`]. The engine can't finish closing while one of
/// these is alive.
pub type EngineBatch<'a> = Batch<MappedRwLockReadGuard<'a, BatchWriter>>;

/// Background thread that periodically removes expired messages.
struct Sweeper {
    quit: Sender<()>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    fn spawn(state: Weak<RwLock<Option<Open>>>, interval: Duration) -> Result<Self> {
        let (quit, quit_rx) = crossbeam_channel::bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name(String::from("tidepool-sweeper"))
            .spawn(move || {
                loop {
                    match quit_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                    let state = match state.upgrade() {
                        Some(x) => x,
                        None => break,
                    };
                    let guard = state.read();
                    match guard.as_ref() {
                        Some(open) => {
                            if let Err(e) = open.sweep_expired(Timestamp::now()) {
                                error!("Sweeper::spawn() -- sweep failed: {}", e);
                            }
                        }
                        None => break,
                    }
                }
                debug!("Sweeper::spawn() -- exiting");
            })
            .map_err(Error::unavailable)?;
        Ok(Self { quit, handle })
    }

    fn stop(self) {
        let _ = self.quit.send(());
        if self.handle.join().is_err() {
            warn!("Sweeper::stop() -- sweeper thread panicked");
        }
    }
}

/// Everything that only exists while the engine is open.
struct Open {
    writer: BatchWriter,
    config: StoreConfig,
    sweeper: Option<Sweeper>,
}

impl Open {
    fn expiry(&self, now: Timestamp) -> Option<Timestamp> {
        self.config.default_ttl_secs().map(|ttl| now.add_secs(ttl))
    }

    fn put_one(&self, entry: Entry) -> Result<()> {
        let mut batch = self.writer.begin();
        batch.put_entry(entry)?;
        batch.commit()
    }

    fn sweep_expired(&self, now: Timestamp) -> Result<usize> {
        let expired = self.writer.index().expired(now);
        if expired.is_empty() {
            return Ok(0);
        }
        let count = expired.len();
        let mut batch = self.writer.begin();
        for key in expired {
            batch.expire_entry(key, now)?;
        }
        batch.commit()?;
        debug!("Open::sweep_expired() -- swept {} entries", count);
        Ok(count)
    }
}

/// The storage engine. Create one with [`Engine::new`], then [`open`][Engine::open] it.
///
/// All operations take `&self` and are safe to call from multiple threads at once.
pub struct Engine {
    state: Arc<RwLock<Option<Open>>>,
    ids: IdGenerator,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("open", &self.is_open())
            .finish()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Create a new, closed engine.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(None)),
            ids: IdGenerator::new(),
        }
    }

    /// The name this engine registers under
    pub fn name(&self) -> &'static str {
        ENGINE_NAME
    }

    /// Whether [`open`][Engine::open] has been called (and [`close`][Engine::close] hasn't).
    pub fn is_open(&self) -> bool {
        self.state.read_recursive().is_some()
    }

    /// Borrow the open state. The read is recursive: a caller holding an [`EngineBatch`] can
    /// keep using the engine even after `close()` has started waiting for the write lock.
    fn open_state(&self) -> Result<MappedRwLockReadGuard<'_, Open>> {
        RwLockReadGuard::try_map(self.state.read_recursive(), |state| state.as_ref())
            .map_err(|_| Error::Closed)
    }

    /// Open the store described by `config`, creating its directories if needed and replaying
    /// whatever's already on disk.
    #[tracing::instrument(skip(self, config), fields(dir = %config.directory().display()))]
    pub fn open(&self, config: &StoreConfig) -> Result<()> {
        let mut state = self.state.write();
        if state.is_some() {
            return Err(Error::AlreadyOpen);
        }
        for dir in [config.directory().as_path(), config.value_dir()] {
            // if this fails, opening the log will fail too and report why
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!("Engine::open() -- unable to create {}: {}", dir.display(), e);
            }
        }
        let writer = BatchWriter::open(
            config.directory(),
            config.value_dir(),
            config.value_threshold(),
            config.sync_writes(),
        ).map_err(|e| {
            error!("Engine::open() -- unable to open store: {}", e);
            match e {
                Error::StorageUnavailable(_) => e,
                e => Error::unavailable(e),
            }
        })?;
        let sweeper = config.sweep_interval_ms()
            .map(|ms| Sweeper::spawn(Arc::downgrade(&self.state), Duration::from_millis(ms.max(1))))
            .transpose()?;
        info!("Engine::open() -- opened with {} entries", writer.index().len());
        *state = Some(Open {
            writer,
            config: config.clone(),
            sweeper,
        });
        Ok(())
    }

    /// Parse a YAML/JSON config string and [`open`][Engine::open] with it.
    pub fn open_str(&self, config: &str) -> Result<()> {
        let config = StoreConfig::parse(config)?;
        self.open(&config)
    }

    /// Close the store. Waits for in-flight operations (and any batches from
    /// [`begin`][Engine::begin]) to finish, stops the sweeper, and flushes everything to disk.
    ///
    /// Closing an engine that isn't open does nothing and succeeds.
    pub fn close(&self) -> Result<()> {
        let open = match self.state.write().take() {
            Some(open) => open,
            None => return Ok(()),
        };
        let Open { writer, sweeper, .. } = open;
        if let Some(sweeper) = sweeper {
            sweeper.stop();
        }
        let res = writer.sync();
        drop(writer);
        info!("Engine::close() -- closed");
        res
    }

    /// Start a batch. Everything queued on it is applied atomically on
    /// [`commit`][Batch::commit].
    pub fn begin(&self) -> Result<EngineBatch<'_>> {
        let open = self.open_state()?;
        Ok(Batch::new(MappedRwLockReadGuard::map(open, |open| &open.writer)))
    }

    /// Append a message to a topic, returning the id generated for it.
    pub fn put<C: Into<Contract>>(&self, contract: C, topic: &[u8], payload: &[u8]) -> Result<MessageId> {
        let open = self.open_state()?;
        let contract: Contract = contract.into();
        let id = self.ids.generate(contract, topic, payload)?;
        let now = Timestamp::now();
        let entry = Entry::new(contract, topic, payload)
            .with_id(id.clone())
            .with_timestamp(now)
            .with_expiry(open.expiry(now));
        open.put_one(entry)?;
        Ok(id)
    }

    /// Store a message under an id the caller already has. An existing message with the same
    /// id in the same topic is overwritten.
    pub fn put_with_id<C, I>(&self, contract: C, topic: &[u8], id: I, payload: &[u8]) -> Result<()>
        where C: Into<Contract>,
              I: Into<MessageId>,
    {
        let open = self.open_state()?;
        let now = Timestamp::now();
        let entry = Entry::new(contract, topic, payload)
            .with_id(id)
            .with_timestamp(now)
            .with_expiry(open.expiry(now));
        open.put_one(entry)
    }

    /// Fetch up to `limit` of the newest payloads in a topic, newest first. `limit` is capped at
    /// [`MAX_RESULTS`]. Expired messages are skipped.
    ///
    /// If a record fails to load partway through, the payloads read so far come back inside
    /// [`Error::PartialScan`].
    pub fn get<C: Into<Contract>>(&self, contract: C, topic: &[u8], limit: usize) -> Result<Vec<Vec<u8>>> {
        let open = self.open_state()?;
        let limit = limit.min(MAX_RESULTS);
        let scan = open.writer.index().range_scan_live(contract, topic, limit, Timestamp::now());
        let mut payloads = Vec::with_capacity(scan.len());
        for (id, entry) in scan {
            match open.writer.read_entry(entry.locator()) {
                Ok(entry) => payloads.push(entry.into_payload()),
                Err(e) => {
                    error!("Engine::get() -- unable to read message {}: {}", id, e);
                    return Err(Error::PartialScan { payloads, source: Box::new(e) });
                }
            }
        }
        Ok(payloads)
    }

    /// Delete a message. Deleting something that isn't there is not an error.
    pub fn delete<C, I>(&self, contract: C, topic: &[u8], id: I) -> Result<()>
        where C: Into<Contract>,
              I: Into<MessageId>,
    {
        let open = self.open_state()?;
        let mut batch = open.writer.begin();
        batch.delete_entry(IndexKey::new(contract, topic, id))?;
        batch.commit()
    }

    /// Generate an id for a message without storing anything. Works whether or not the engine
    /// is open.
    pub fn gen_id<C: Into<Contract>>(&self, contract: C, topic: &[u8], payload: &[u8]) -> Result<MessageId> {
        self.ids.generate(contract, topic, payload)
    }

    /// Remove every message that has expired, returning how many were removed.
    pub fn sweep_expired(&self) -> Result<usize> {
        self.open_state()?.sweep_expired(Timestamp::now())
    }

    /// Rewrite the record log to hold only live messages, returning how many that is.
    pub fn compact(&self) -> Result<usize> {
        let open = self.open_state()?;
        let count = open.writer.compact()?;
        info!("Engine::compact() -- log now holds {} entries", count);
        Ok(count)
    }

    /// The number of messages in the store (including expired ones not swept yet).
    pub fn len(&self) -> Result<usize> {
        Ok(self.open_state()?.writer.index().len())
    }

    /// Whether the store holds no messages
    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|x| x == 0)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Engine::drop() -- error closing: {}", e);
        }
    }
}
