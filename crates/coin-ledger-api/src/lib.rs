//! Session layer shared by the HTTP service and the CLI.
//!
//! A [`LedgerSession`] owns one store handle and the snapshot loaded from it.
//! Mutations go through the core operations and are stamped with the time
//! and the digest of the table that was persisted.

use coin_ledger_core::{
    apply_adjustment, leaderboard, load_snapshot, member_view, redeem, roster, Adjustment,
    AdjustmentReceipt, LeaderboardEntry, LedgerError, LedgerSnapshot, LedgerStore, LedgerTable,
    MemberView, StatusCorrection,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

mod config;

pub use config::{DynStore, StoreConfig};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdjustRequest {
    pub name: String,
    pub delta: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AdjustmentResult {
    #[serde(flatten)]
    pub receipt: AdjustmentReceipt,
    pub confirmation: String,
    #[serde(with = "time::serde::rfc3339")]
    pub applied_at: OffsetDateTime,
    pub snapshot_digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterView {
    pub snapshot_digest: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderboardView {
    pub snapshot_digest: String,
    pub entries: Vec<LeaderboardEntry>,
}

pub struct LedgerSession<S = DynStore> {
    session_id: Ulid,
    store: S,
    snapshot: LedgerSnapshot,
    status_corrections: Vec<StatusCorrection>,
}

impl<S> LedgerSession<S>
where
    S: LedgerStore,
{
    /// Load the snapshot with one full read of `store`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Connection`] when the store cannot be read and
    /// [`LedgerError::Schema`] when the table is malformed.
    pub fn open(store: S) -> Result<Self, LedgerError> {
        let session_id = Ulid::new();
        let load = load_snapshot(&store).inspect_err(|err| {
            tracing::error!(%session_id, kind = err.kind(), error = %err, "ledger load failed");
        })?;

        for correction in &load.status_corrections {
            tracing::warn!(
                %session_id,
                row = correction.row,
                name = %correction.name,
                recorded = ?correction.recorded,
                derived = %correction.derived,
                "recorded membership status disagrees with balance; using derived status"
            );
        }
        tracing::info!(%session_id, members = load.snapshot.len(), "ledger session opened");

        Ok(Self {
            session_id,
            store,
            snapshot: load.snapshot,
            status_corrections: load.status_corrections,
        })
    }

    #[must_use]
    pub fn session_id(&self) -> Ulid {
        self.session_id
    }

    #[must_use]
    pub fn snapshot(&self) -> &LedgerSnapshot {
        &self.snapshot
    }

    #[must_use]
    pub fn status_corrections(&self) -> &[StatusCorrection] {
        &self.status_corrections
    }

    /// Digest of the table this session would persist right now.
    #[must_use]
    pub fn snapshot_digest(&self) -> String {
        table_digest(&self.snapshot.to_table())
    }

    /// Self-service view of one member.
    ///
    /// # Errors
    /// Returns [`LedgerError::MemberNotFound`] for an unknown name.
    pub fn member(&self, name: &str) -> Result<MemberView, LedgerError> {
        member_view(&self.snapshot, name.trim())
    }

    #[must_use]
    pub fn roster(&self) -> RosterView {
        RosterView { snapshot_digest: self.snapshot_digest(), members: roster(&self.snapshot) }
    }

    #[must_use]
    pub fn leaderboard(&self) -> LeaderboardView {
        LeaderboardView {
            snapshot_digest: self.snapshot_digest(),
            entries: leaderboard(&self.snapshot),
        }
    }

    /// Admin adjustment. The reason is free text and may be empty; a blank
    /// name matches no member.
    ///
    /// # Errors
    /// Returns any error of [`apply_adjustment`]. On
    /// [`LedgerError::StoreWrite`] the session keeps the adjusted balance.
    pub fn adjust(&mut self, request: AdjustRequest) -> Result<AdjustmentResult, LedgerError> {
        let adjustment = Adjustment {
            name: request.name.trim().to_string(),
            delta: request.delta,
            reason: request.reason.trim().to_string(),
        };
        let outcome = apply_adjustment(&mut self.snapshot, &mut self.store, &adjustment);
        self.finish("adjustment", outcome)
    }

    /// Self-service reward redemption.
    ///
    /// # Errors
    /// Returns [`LedgerError::MemberNotFound`], [`LedgerError::NotEligible`],
    /// or [`LedgerError::StoreWrite`].
    pub fn redeem(&mut self, name: &str) -> Result<AdjustmentResult, LedgerError> {
        let outcome = redeem(&mut self.snapshot, &mut self.store, name.trim());
        self.finish("redemption", outcome)
    }

    fn finish(
        &self,
        operation: &'static str,
        outcome: Result<AdjustmentReceipt, LedgerError>,
    ) -> Result<AdjustmentResult, LedgerError> {
        match outcome {
            Ok(receipt) => {
                let confirmation = receipt.confirmation();
                tracing::info!(
                    session_id = %self.session_id,
                    operation,
                    name = %receipt.name,
                    delta = receipt.delta,
                    coin = receipt.coin_after,
                    status = %receipt.status_after,
                    "{confirmation}"
                );
                Ok(AdjustmentResult {
                    receipt,
                    confirmation,
                    applied_at: OffsetDateTime::now_utc(),
                    snapshot_digest: self.snapshot_digest(),
                })
            }
            Err(err @ LedgerError::StoreWrite { .. }) => {
                tracing::error!(
                    session_id = %self.session_id,
                    operation,
                    error = %err,
                    "store write failed; session snapshot now differs from the store"
                );
                Err(err)
            }
            Err(err) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    operation,
                    kind = err.kind(),
                    error = %err,
                    "ledger operation rejected"
                );
                Err(err)
            }
        }
    }
}

/// `sha256:` plus the hex digest over every cell, header first, with unit
/// and record separators between cells and rows.
#[must_use]
pub fn table_digest(table: &LedgerTable) -> String {
    let mut hasher = Sha256::new();
    for row in std::iter::once(&table.header).chain(&table.rows) {
        for cell in row {
            hasher.update(cell.as_bytes());
            hasher.update([0x1f]);
        }
        hasher.update([0x1e]);
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use coin_ledger_core::memory::MemoryStore;
    use coin_ledger_core::{MembershipStatus, LEDGER_HEADER};

    use super::*;

    fn fixture_store() -> MemoryStore {
        let rows = [
            ["Kim", "25", "member", "maintained"],
            ["Lee", "15", "core-group", "maintained"],
            ["Park", "18", "member", "warning(at-risk)"],
            ["Choi", "42", "member", "maintained"],
        ];
        MemoryStore::new(LedgerTable {
            header: LEDGER_HEADER.map(String::from).to_vec(),
            rows: rows.iter().map(|row| row.map(String::from).to_vec()).collect(),
        })
    }

    fn adjust_request(name: &str, delta: i64, reason: &str) -> AdjustRequest {
        AdjustRequest { name: name.to_string(), delta, reason: reason.to_string() }
    }

    #[test]
    fn open_keeps_corrections_and_derives_status() -> Result<()> {
        let store = fixture_store();
        let mut table = store.table();
        table.rows[0][3] = "warning(at-risk)".to_string();
        let store = MemoryStore::new(table);

        let session = LedgerSession::open(store)?;
        assert_eq!(session.status_corrections().len(), 1);
        assert_eq!(session.status_corrections()[0].name, "Kim");
        assert_eq!(session.member("Kim")?.membership_status, MembershipStatus::Maintained);
        Ok(())
    }

    #[test]
    fn unreachable_store_fails_open_with_connection_error() {
        let store = fixture_store();
        store.fail_reads_with("network down");
        match LedgerSession::open(store) {
            Err(LedgerError::Connection(message)) => assert!(message.contains("network down")),
            Err(other) => panic!("expected connection error, got {other}"),
            Ok(_) => panic!("session should not open"),
        }
    }

    #[test]
    fn adjust_persists_and_stamps_result() -> Result<()> {
        let store = fixture_store();
        let mut session = LedgerSession::open(store.clone())?;
        let digest_before = session.roster().snapshot_digest;

        let result = session.adjust(adjust_request(" Park ", 10, "meeting attendance"))?;
        assert_eq!(result.receipt.coin_after, 28);
        assert_eq!(result.receipt.status_after, MembershipStatus::Maintained);
        assert!(result.confirmation.contains("Park"));
        assert!(result.confirmation.contains("+10"));
        assert!(result.confirmation.contains("meeting attendance"));
        assert_ne!(result.snapshot_digest, digest_before);
        assert_eq!(result.snapshot_digest, table_digest(&store.table()));
        assert_eq!(store.write_count(), 1);
        Ok(())
    }

    #[test]
    fn empty_reason_is_accepted() -> Result<()> {
        let store = fixture_store();
        let mut session = LedgerSession::open(store.clone())?;

        let result = session.adjust(adjust_request("Kim", 5, "  "))?;
        assert_eq!(result.receipt.reason, "");
        assert_eq!(result.receipt.coin_after, 30);
        assert_eq!(store.write_count(), 1);
        Ok(())
    }

    #[test]
    fn blank_name_is_an_unknown_member() -> Result<()> {
        let store = fixture_store();
        let mut session = LedgerSession::open(store.clone())?;

        match session.adjust(adjust_request("   ", 5, "meeting attendance")) {
            Err(LedgerError::MemberNotFound(name)) => assert_eq!(name, ""),
            other => panic!("expected member not found, got {other:?}"),
        }
        assert_eq!(store.write_count(), 0);
        Ok(())
    }

    #[test]
    fn failed_write_keeps_adjusted_balance_in_session() -> Result<()> {
        let store = fixture_store();
        let mut session = LedgerSession::open(store.clone())?;
        store.fail_writes_with("quota exceeded");

        match session.adjust(adjust_request("Choi", -5, "late fee")) {
            Err(LedgerError::StoreWrite { coin, message, .. }) => {
                assert_eq!(coin, 37);
                assert!(message.contains("quota exceeded"));
            }
            other => panic!("expected store write error, got {other:?}"),
        }
        assert_eq!(session.member("Choi")?.coin, 37);
        assert_ne!(session.snapshot_digest(), table_digest(&store.table()));
        Ok(())
    }

    #[test]
    fn redeem_checks_eligibility_and_deducts_cost() -> Result<()> {
        let store = fixture_store();
        let mut session = LedgerSession::open(store)?;

        match session.redeem("Kim") {
            Err(LedgerError::NotEligible { coin, cost, .. }) => {
                assert_eq!((coin, cost), (25, 30));
            }
            other => panic!("expected not eligible, got {other:?}"),
        }

        let result = session.redeem("Choi")?;
        assert_eq!(result.receipt.coin_after, 12);
        assert_eq!(result.receipt.status_after, MembershipStatus::Warning);
        assert_eq!(result.receipt.reason, "reward redemption");
        Ok(())
    }

    #[test]
    fn leaderboard_view_orders_entries_and_serializes_flat_result() -> Result<()> {
        let mut session = LedgerSession::open(fixture_store())?;
        let names = session
            .leaderboard()
            .entries
            .into_iter()
            .map(|entry| entry.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["Choi", "Kim", "Park", "Lee"]);

        let result = session.adjust(adjust_request("Lee", 3, "cleanup duty"))?;
        let json = serde_json::to_value(&result)?;
        assert_eq!(json["name"], "Lee");
        assert_eq!(json["coin_after"], 18);
        assert!(json["applied_at"].is_string());
        Ok(())
    }

    #[test]
    fn table_digest_is_stable_and_cell_boundary_aware() {
        let lhs = LedgerTable { header: vec!["ab".to_string(), "c".to_string()], rows: Vec::new() };
        let rhs = LedgerTable { header: vec!["a".to_string(), "bc".to_string()], rows: Vec::new() };
        assert_eq!(table_digest(&lhs), table_digest(&lhs));
        assert_ne!(table_digest(&lhs), table_digest(&rhs));
        assert!(table_digest(&lhs).starts_with("sha256:"));
    }
}
