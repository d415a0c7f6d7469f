//! In-memory [`LedgerStore`] used by tests and local demos.
//!
//! Clones share the same underlying table, so a caller can hand one clone to
//! a session and keep another to inspect what was persisted.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{LedgerStore, LedgerTable};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{0}")]
pub struct MemoryStoreError(pub String);

#[derive(Debug, Default)]
struct MemoryState {
    table: LedgerTable,
    fail_reads: Option<String>,
    fail_writes: Option<String>,
    writes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(table: LedgerTable) -> Self {
        Self { state: Arc::new(Mutex::new(MemoryState { table, ..MemoryState::default() })) }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every following `read_all` fail with `message`.
    pub fn fail_reads_with(&self, message: impl Into<String>) {
        self.lock().fail_reads = Some(message.into());
    }

    /// Make every following `write_all` fail with `message`.
    pub fn fail_writes_with(&self, message: impl Into<String>) {
        self.lock().fail_writes = Some(message.into());
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.fail_reads = None;
        state.fail_writes = None;
    }

    #[must_use]
    pub fn table(&self) -> LedgerTable {
        self.lock().table.clone()
    }

    /// Number of successful overwrites so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }
}

impl LedgerStore for MemoryStore {
    type Error = MemoryStoreError;

    fn read_all(&self) -> Result<LedgerTable, Self::Error> {
        let state = self.lock();
        if let Some(message) = &state.fail_reads {
            return Err(MemoryStoreError(message.clone()));
        }
        Ok(state.table.clone())
    }

    fn write_all(&mut self, table: &LedgerTable) -> Result<(), Self::Error> {
        let mut state = self.lock();
        if let Some(message) = &state.fail_writes {
            return Err(MemoryStoreError(message.clone()));
        }
        state.table = table.clone();
        state.writes += 1;
        Ok(())
    }
}
