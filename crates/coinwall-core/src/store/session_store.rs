// ── Session store ──
//
// Concurrent per-device rows. Single-row updates run under the row's
// DashMap shard lock, so a coin finalize and a countdown debit on the
// same device never interleave inside one update. Scans work on cloned
// snapshots and tolerate rows changing underneath them.
//
// A file-backed store holds an exclusive lock on a `.lock` sidecar for as
// long as it lives, so only one process at a time can write the state.

use std::ffi::OsString;
use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::debug;

use super::persist::{self, StateFile};
use crate::error::StoreError;
use crate::model::{MacAddress, SaleRecord, Session};

/// Durable record of per-device billing state, plus the sale ledger.
pub struct SessionStore {
    rows: DashMap<MacAddress, Session>,
    sales: Mutex<Vec<SaleRecord>>,
    path: Option<PathBuf>,
    /// Held for the store's lifetime; dropping it releases the lock.
    _lock: Option<File>,
    dirty: AtomicBool,
    /// Bumped on every mutation so consumers can watch for changes.
    version: watch::Sender<u64>,
}

impl SessionStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            rows: DashMap::new(),
            sales: Mutex::new(Vec::new()),
            path: None,
            _lock: None,
            dirty: AtomicBool::new(false),
            version,
        }
    }

    /// Open a file-backed store, loading existing state if present.
    ///
    /// Fails with [`StoreError::Locked`] while another store has the same
    /// file open.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let lock = lock_state_file(&path)?;
        let state = persist::load(&path)?;
        let store = Self {
            path: Some(path),
            _lock: Some(lock),
            ..Self::in_memory()
        };
        store.fill(state);
        debug!(sessions = store.rows.len(), "session store loaded");
        Ok(store)
    }

    /// Load the current contents of a state file into a detached,
    /// in-memory store. Takes no lock and never writes back.
    pub fn read_snapshot(path: &Path) -> Result<Self, StoreError> {
        let store = Self::in_memory();
        store.fill(persist::load(path)?);
        Ok(store)
    }

    fn fill(&self, state: StateFile) {
        for session in state.sessions {
            self.rows.insert(session.mac.clone(), session);
        }
        *self.sales.lock().unwrap_or_else(PoisonError::into_inner) = state.sales;
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn get(&self, mac: &MacAddress) -> Option<Session> {
        self.rows.get(mac).map(|r| r.value().clone())
    }

    pub fn by_client_id(&self, client_id: &str) -> Option<Session> {
        self.rows
            .iter()
            .find(|r| r.value().client_id.as_deref() == Some(client_id))
            .map(|r| r.value().clone())
    }

    /// Every row, sorted by MAC for stable output.
    pub fn snapshot(&self) -> Vec<Session> {
        let mut rows: Vec<Session> = self.rows.iter().map(|r| r.value().clone()).collect();
        rows.sort_by(|a, b| a.mac.cmp(&b.mac));
        rows
    }

    pub fn query(&self, pred: impl Fn(&Session) -> bool) -> Vec<Session> {
        self.rows
            .iter()
            .filter(|r| pred(r.value()))
            .map(|r| r.value().clone())
            .collect()
    }

    /// Rows the enforcer should currently allow.
    pub fn billable(&self) -> Vec<Session> {
        self.query(Session::is_billable)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn sales(&self) -> Vec<SaleRecord> {
        self.sales
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Subscribe to the mutation counter.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Update an existing row in place. Returns `None` when the device has
    /// no row.
    ///
    /// `f` runs under the row lock and must not call back into the store.
    pub fn update<R>(&self, mac: &MacAddress, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let result = {
            let mut row = self.rows.get_mut(mac)?;
            f(row.value_mut())
        };
        self.touch();
        Some(result)
    }

    /// Update a row, creating it first if the device is new.
    pub fn upsert<R>(
        &self,
        mac: &MacAddress,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut Session) -> R,
    ) -> R {
        let result = {
            let mut row = self
                .rows
                .entry(mac.clone())
                .or_insert_with(|| Session::new(mac.clone(), now));
            f(row.value_mut())
        };
        self.touch();
        result
    }

    pub fn insert(&self, session: Session) {
        self.rows.insert(session.mac.clone(), session);
        self.touch();
    }

    pub fn remove(&self, mac: &MacAddress) -> Option<Session> {
        let removed = self.rows.remove(mac).map(|(_, v)| v);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    pub fn record_sale(&self, sale: SaleRecord) {
        self.sales
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sale);
        self.touch();
    }

    // ── Persistence ──────────────────────────────────────────────────

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Write state to disk if anything changed since the last flush.
    /// No-op for in-memory stores. Blocking; run off the async runtime.
    pub fn flush(&self) -> Result<bool, StoreError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(false);
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let state = StateFile::new(self.snapshot(), self.sales());
        if let Err(e) = persist::save(path, &state) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        debug!(path = %path.display(), sessions = state.sessions.len(), "state flushed");
        Ok(true)
    }

    fn touch(&self) {
        self.dirty.store(true, Ordering::Release);
        self.version.send_modify(|v| *v += 1);
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

fn lock_state_file(path: &Path) -> Result<File, StoreError> {
    let lock_path = lock_path(path);
    if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)?;
    match file.try_lock() {
        Ok(()) => Ok(file),
        Err(TryLockError::WouldBlock) => Err(StoreError::Locked {
            path: path.to_path_buf(),
        }),
        Err(TryLockError::Error(e)) => Err(e.into()),
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::ChannelKey;

    fn mac(n: u8) -> MacAddress {
        MacAddress::new(format!("aa:bb:cc:dd:ee:{n:02x}"))
    }

    #[test]
    fn subscribers_wake_on_write() {
        let store = SessionStore::in_memory();
        let mut rx = store.subscribe();
        let mut changed = tokio_test::task::spawn(rx.changed());
        tokio_test::assert_pending!(changed.poll());

        store.upsert(&mac(1), Utc::now(), |s| s.time_remaining = 5);
        assert!(changed.is_woken());
        tokio_test::assert_ready_ok!(changed.poll());
    }

    #[test]
    fn update_missing_row_returns_none() {
        let store = SessionStore::in_memory();
        assert!(store.update(&mac(1), |s| s.time_remaining = 5).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn upsert_creates_then_updates() {
        let store = SessionStore::in_memory();
        let now = Utc::now();
        store.upsert(&mac(1), now, |s| s.time_remaining = 60);
        store.upsert(&mac(1), now, |s| s.time_remaining += 60);
        assert_eq!(store.get(&mac(1)).unwrap().time_remaining, 120);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn billable_filters_paused_and_expired() {
        let store = SessionStore::in_memory();
        let now = Utc::now();
        store.upsert(&mac(1), now, |s| {
            s.is_connected = true;
            s.time_remaining = 10;
        });
        store.upsert(&mac(2), now, |s| {
            s.is_connected = true;
            s.is_paused = true;
            s.time_remaining = 10;
        });
        store.upsert(&mac(3), now, |s| s.is_connected = true);

        let billable = store.billable();
        assert_eq!(billable.len(), 1);
        assert_eq!(billable[0].mac, mac(1));
    }

    #[test]
    fn mutations_bump_version() {
        let store = SessionStore::in_memory();
        let rx = store.subscribe();
        store.upsert(&mac(1), Utc::now(), |_| ());
        store.remove(&mac(1));
        assert_eq!(*rx.borrow(), 2);
    }

    #[test]
    fn flush_and_reopen_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("sessions.json");

        let store = SessionStore::open(&path).unwrap();
        assert!(store.is_empty());
        store.upsert(&mac(7), Utc::now(), |s| {
            s.time_remaining = 900;
            s.client_id = Some("cookie-7".into());
        });
        store.record_sale(SaleRecord::new(
            mac(7),
            ChannelKey::Hardware,
            "hardware".into(),
            10,
            Utc::now(),
        ));
        assert!(store.flush().unwrap());
        assert!(!store.flush().unwrap(), "clean store should not rewrite");
        drop(store);

        let reopened = SessionStore::open(&path).unwrap();
        assert_eq!(reopened.get(&mac(7)).unwrap().time_remaining, 900);
        assert_eq!(reopened.by_client_id("cookie-7").unwrap().mac, mac(7));
        assert_eq!(reopened.sales().len(), 1);
    }

    #[test]
    fn second_open_of_same_file_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");

        let daemon = SessionStore::open(&path).unwrap();
        daemon.upsert(&mac(3), Utc::now(), |s| s.time_remaining = 60);
        daemon.flush().unwrap();

        assert!(matches!(
            SessionStore::open(&path),
            Err(StoreError::Locked { .. })
        ));
        let snapshot = SessionStore::read_snapshot(&path).unwrap();
        assert_eq!(snapshot.get(&mac(3)).unwrap().time_remaining, 60);
        assert!(snapshot.path().is_none());

        drop(daemon);
        assert!(SessionStore::open(&path).is_ok());
    }

    #[test]
    fn in_memory_flush_is_noop() {
        let store = SessionStore::in_memory();
        store.upsert(&mac(1), Utc::now(), |_| ());
        assert!(!store.flush().unwrap());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            SessionStore::open(&path),
            Err(StoreError::Encoding(_))
        ));
    }
}
