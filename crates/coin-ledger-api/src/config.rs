use std::path::PathBuf;

use coin_ledger_core::{LedgerError, LedgerStore};
use coin_ledger_store_sheets::{resolve_credentials, SheetsConfig, SheetsLedgerStore};
use coin_ledger_store_sqlite::SqliteLedgerStore;

use crate::LedgerSession;

/// A store handle chosen at startup.
pub type DynStore = Box<dyn LedgerStore<Error = anyhow::Error> + Send>;

/// Which backend holds the ledger table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    Sqlite {
        db_path: PathBuf,
    },
    Sheets {
        sheets: SheetsConfig,
        secret_name: String,
        key_file: PathBuf,
    },
}

impl StoreConfig {
    /// Short human label for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Sqlite { db_path } => format!("sqlite:{}", db_path.display()),
            Self::Sheets { sheets, .. } => format!(
                "sheets:{}/{}",
                sheets.spreadsheet_id,
                sheets.range.as_deref().unwrap_or("<first worksheet>")
            ),
        }
    }

    /// Open the configured backend.
    ///
    /// # Errors
    /// Returns [`LedgerError::Connection`] when the database cannot be opened
    /// or no spreadsheet credentials can be resolved.
    pub fn open_store(&self) -> Result<DynStore, LedgerError> {
        match self {
            Self::Sqlite { db_path } => {
                let store = SqliteLedgerStore::open(db_path)
                    .map_err(|err| LedgerError::Connection(format!("{err:#}")))?;
                Ok(Box::new(store))
            }
            Self::Sheets { sheets, secret_name, key_file } => {
                let credentials = resolve_credentials(secret_name, key_file)
                    .map_err(|err| LedgerError::Connection(format!("{err:#}")))?;
                tracing::debug!(
                    source = ?credentials.source(),
                    kind = ?credentials.kind(),
                    "resolved spreadsheet credentials"
                );
                Ok(Box::new(SheetsLedgerStore::new(sheets.clone(), credentials)))
            }
        }
    }

    /// Open the backend and load one session from it.
    ///
    /// # Errors
    /// Returns [`LedgerError::Connection`] or [`LedgerError::Schema`] as
    /// [`LedgerSession::open`] does.
    pub fn open_session(&self) -> Result<LedgerSession, LedgerError> {
        tracing::info!(store = %self.describe(), "opening ledger store");
        LedgerSession::open(self.open_store()?)
    }
}
