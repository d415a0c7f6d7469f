use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub mod memory;

/// Balances at or below this value put non-exempt members at risk.
pub const STATUS_WARNING_THRESHOLD: i64 = 20;
pub const CORE_GROUP_ROLE: &str = "core-group";
const CORE_GROUP_ROLE_NATIVE: &str = "코어그룹";

pub const REDEMPTION_COST: i64 = 30;
pub const REDEMPTION_REASON: &str = "reward redemption";

pub const HEADER_NAME: &str = "이름";
pub const HEADER_COIN: &str = "코인";
pub const HEADER_ROLE: &str = "역할";
pub const HEADER_STATUS: &str = "멤버십상태";
pub const LEDGER_HEADER: [&str; 4] = [HEADER_NAME, HEADER_COIN, HEADER_ROLE, HEADER_STATUS];

const COLUMN_NAME: usize = 0;
const COLUMN_COIN: usize = 1;
const COLUMN_ROLE: usize = 2;
const COLUMN_STATUS: usize = 3;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("member not found: {0}")]
    MemberNotFound(String),
    #[error(
        "store write error: {message}; in-memory balance for {name} is now {coin} after {delta:+} but the store was not updated"
    )]
    StoreWrite { name: String, delta: i64, coin: i64, message: String },
    #[error("{name} holds {coin} coin; redemption requires at least {cost}")]
    NotEligible { name: String, coin: i64, cost: i64 },
    #[error("validation error: {0}")]
    Validation(String),
}

impl LedgerError {
    /// Stable machine-readable tag for presentation layers.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Schema(_) => "schema",
            Self::MemberNotFound(_) => "member_not_found",
            Self::StoreWrite { .. } => "store_write",
            Self::NotEligible { .. } => "not_eligible",
            Self::Validation(_) => "validation",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum MembershipStatus {
    #[serde(rename = "maintained")]
    Maintained,
    #[serde(rename = "warning(at-risk)")]
    Warning,
}

impl MembershipStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Maintained => "maintained",
            Self::Warning => "warning(at-risk)",
        }
    }

    /// Parse a status label, accepting the spreadsheet's native spellings.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "maintained" | "유지" => Some(Self::Maintained),
            "warning(at-risk)" | "경고(위험)" => Some(Self::Warning),
            _ => None,
        }
    }
}

impl Display for MembershipStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[must_use]
pub fn is_core_group(role: &str) -> bool {
    role == CORE_GROUP_ROLE || role == CORE_GROUP_ROLE_NATIVE
}

/// Derive membership status from a balance and a role.
#[must_use]
pub fn derive_status(coin: i64, role: &str) -> MembershipStatus {
    if coin <= STATUS_WARNING_THRESHOLD && !is_core_group(role) {
        MembershipStatus::Warning
    } else {
        MembershipStatus::Maintained
    }
}

#[must_use]
pub fn can_redeem(coin: i64) -> bool {
    coin >= REDEMPTION_COST
}

/// One roster entry. Status is always derived from `coin` and `role`.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct Member {
    name: String,
    coin: i64,
    role: String,
    membership_status: MembershipStatus,
}

impl Member {
    #[must_use]
    pub fn new(name: impl Into<String>, coin: i64, role: impl Into<String>) -> Self {
        let role = role.into();
        let membership_status = derive_status(coin, &role);
        Self { name: name.into(), coin, role, membership_status }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn coin(&self) -> i64 {
        self.coin
    }

    #[must_use]
    pub fn role(&self) -> &str {
        &self.role
    }

    #[must_use]
    pub fn membership_status(&self) -> MembershipStatus {
        self.membership_status
    }

    fn set_coin(&mut self, coin: i64) {
        self.coin = coin;
        self.membership_status = derive_status(coin, &self.role);
    }

    fn to_row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.coin.to_string(),
            self.role.clone(),
            self.membership_status.as_str().to_string(),
        ]
    }
}

/// Store-facing table: a header row followed by untyped data rows.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct LedgerTable {
    pub header: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
}

impl LedgerTable {
    #[must_use]
    pub fn with_canonical_header() -> Self {
        Self { header: LEDGER_HEADER.iter().map(ToString::to_string).collect(), rows: Vec::new() }
    }
}

/// A recorded status label that disagreed with the derived one at load time.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct StatusCorrection {
    pub row: usize,
    pub name: String,
    pub recorded: Option<MembershipStatus>,
    pub derived: MembershipStatus,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SnapshotLoad {
    pub snapshot: LedgerSnapshot,
    pub status_corrections: Vec<StatusCorrection>,
}

/// The single in-process working copy of the ledger table.
#[derive(Debug, Clone, Serialize, Eq, PartialEq, Default)]
pub struct LedgerSnapshot {
    members: Vec<Member>,
}

impl LedgerSnapshot {
    /// Build a snapshot from already-typed members.
    ///
    /// # Errors
    /// Returns [`LedgerError::Schema`] when a name is empty or appears twice.
    pub fn from_members(members: Vec<Member>) -> Result<Self, LedgerError> {
        let mut seen = BTreeSet::new();
        for member in &members {
            if member.name.trim().is_empty() {
                return Err(LedgerError::Schema("member name must be non-empty".to_string()));
            }
            if !seen.insert(member.name.as_str()) {
                return Err(LedgerError::Schema(format!("duplicate member name: {}", member.name)));
            }
        }
        Ok(Self { members })
    }

    /// Validate and type a raw store table.
    ///
    /// Rows are numbered the way the spreadsheet numbers them: the header is
    /// row 1, so the first data row is row 2.
    ///
    /// # Errors
    /// Returns [`LedgerError::Schema`] when the header does not match
    /// [`LEDGER_HEADER`], a row is wider than the header, a name is empty or
    /// duplicated, a coin cell is not an integer, or a status label is unknown.
    pub fn from_table(table: &LedgerTable) -> Result<SnapshotLoad, LedgerError> {
        validate_header(&table.header)?;

        let mut members = Vec::with_capacity(table.rows.len());
        let mut status_corrections = Vec::new();

        for (index, row) in table.rows.iter().enumerate() {
            let row_number = index + 2;
            if row.iter().all(|cell| cell.trim().is_empty()) {
                continue;
            }
            if row.len() > LEDGER_HEADER.len() {
                return Err(LedgerError::Schema(format!(
                    "row {row_number}: expected at most {} cells, found {}",
                    LEDGER_HEADER.len(),
                    row.len()
                )));
            }

            let cell = |column: usize| row.get(column).map_or("", |value| value.trim());

            let name = cell(COLUMN_NAME);
            if name.is_empty() {
                return Err(LedgerError::Schema(format!("row {row_number}: name cell is empty")));
            }
            let coin = parse_coin(cell(COLUMN_COIN), row_number)?;
            let role = cell(COLUMN_ROLE);

            let raw_status = cell(COLUMN_STATUS);
            let recorded = if raw_status.is_empty() {
                None
            } else {
                Some(MembershipStatus::parse(raw_status).ok_or_else(|| {
                    LedgerError::Schema(format!(
                        "row {row_number}: unknown membership status `{raw_status}`"
                    ))
                })?)
            };

            let member = Member::new(name, coin, role);
            if recorded != Some(member.membership_status) {
                status_corrections.push(StatusCorrection {
                    row: row_number,
                    name: member.name.clone(),
                    recorded,
                    derived: member.membership_status,
                });
            }
            members.push(member);
        }

        let snapshot = Self::from_members(members)?;
        Ok(SnapshotLoad { snapshot, status_corrections })
    }

    /// Render the whole snapshot, header included, in snapshot order.
    #[must_use]
    pub fn to_table(&self) -> LedgerTable {
        let mut table = LedgerTable::with_canonical_header();
        table.rows = self.members.iter().map(Member::to_row).collect();
        table
    }

    #[must_use]
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|member| member.name == name)
    }

    fn position(&self, name: &str) -> Result<usize, LedgerError> {
        self.members
            .iter()
            .position(|member| member.name == name)
            .ok_or_else(|| LedgerError::MemberNotFound(name.to_string()))
    }
}

fn validate_header(header: &[String]) -> Result<(), LedgerError> {
    let matches = header.len() == LEDGER_HEADER.len()
        && header.iter().zip(LEDGER_HEADER).all(|(actual, expected)| actual.trim() == expected);
    if matches {
        Ok(())
    } else {
        Err(LedgerError::Schema(format!(
            "header must be [{}], found [{}]",
            LEDGER_HEADER.join(", "),
            header.join(", ")
        )))
    }
}

fn parse_coin(raw: &str, row_number: usize) -> Result<i64, LedgerError> {
    if raw.is_empty() {
        return Err(LedgerError::Schema(format!("row {row_number}: coin cell is empty")));
    }
    if let Ok(value) = raw.parse::<i64>() {
        return Ok(value);
    }
    // Spreadsheet services sometimes render whole numbers as `25.0`.
    if let Some((whole, fraction)) = raw.split_once('.') {
        if !fraction.is_empty() && fraction.bytes().all(|byte| byte == b'0') {
            if let Ok(value) = whole.parse::<i64>() {
                return Ok(value);
            }
        }
    }
    Err(LedgerError::Schema(format!("row {row_number}: coin cell `{raw}` is not an integer")))
}

/// Row storage with bulk read and bulk overwrite only.
pub trait LedgerStore {
    type Error: Display;

    /// Read the entire table, header included.
    ///
    /// # Errors
    /// Returns the backend error when the store cannot be reached or read.
    fn read_all(&self) -> Result<LedgerTable, Self::Error>;

    /// Replace the entire stored table with `table`.
    ///
    /// # Errors
    /// Returns the backend error when the overwrite fails.
    fn write_all(&mut self, table: &LedgerTable) -> Result<(), Self::Error>;
}

impl<S> LedgerStore for Box<S>
where
    S: LedgerStore + ?Sized,
{
    type Error = S::Error;

    fn read_all(&self) -> Result<LedgerTable, Self::Error> {
        (**self).read_all()
    }

    fn write_all(&mut self, table: &LedgerTable) -> Result<(), Self::Error> {
        (**self).write_all(table)
    }
}

/// Load a snapshot with one full read of `store`.
///
/// # Errors
/// Returns [`LedgerError::Connection`] when the read fails and
/// [`LedgerError::Schema`] when the table is malformed.
pub fn load_snapshot<S>(store: &S) -> Result<SnapshotLoad, LedgerError>
where
    S: LedgerStore + ?Sized,
{
    let table = store.read_all().map_err(|err| LedgerError::Connection(format!("{err:#}")))?;
    LedgerSnapshot::from_table(&table)
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Adjustment {
    pub name: String,
    pub delta: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct AdjustmentReceipt {
    pub name: String,
    pub delta: i64,
    pub reason: String,
    pub coin_before: i64,
    pub coin_after: i64,
    pub status_before: MembershipStatus,
    pub status_after: MembershipStatus,
}

impl AdjustmentReceipt {
    #[must_use]
    pub fn confirmation(&self) -> String {
        format!("{}: {:+} coin, {} (saved)", self.name, self.delta, self.reason)
    }
}

/// Apply `adjustment` to the snapshot, then persist the whole snapshot.
///
/// The receipt is only returned once the store accepted the write.
///
/// # Errors
/// Returns [`LedgerError::MemberNotFound`] or [`LedgerError::Validation`]
/// (balance overflow) with the snapshot and store untouched, and
/// [`LedgerError::StoreWrite`] when the persist fails after the in-memory
/// change was made.
pub fn apply_adjustment<S>(
    snapshot: &mut LedgerSnapshot,
    store: &mut S,
    adjustment: &Adjustment,
) -> Result<AdjustmentReceipt, LedgerError>
where
    S: LedgerStore + ?Sized,
{
    let index = snapshot.position(&adjustment.name)?;
    let member = &mut snapshot.members[index];

    let coin_before = member.coin;
    let status_before = member.membership_status;
    let coin_after = coin_before.checked_add(adjustment.delta).ok_or_else(|| {
        LedgerError::Validation(format!(
            "adjusting {} by {:+} overflows the balance",
            adjustment.name, adjustment.delta
        ))
    })?;
    member.set_coin(coin_after);
    let status_after = member.membership_status;

    store.write_all(&snapshot.to_table()).map_err(|err| LedgerError::StoreWrite {
        name: adjustment.name.clone(),
        delta: adjustment.delta,
        coin: coin_after,
        message: format!("{err:#}"),
    })?;

    Ok(AdjustmentReceipt {
        name: adjustment.name.clone(),
        delta: adjustment.delta,
        reason: adjustment.reason.clone(),
        coin_before,
        coin_after,
        status_before,
        status_after,
    })
}

/// Redeem one reward for `name` at [`REDEMPTION_COST`].
///
/// # Errors
/// Returns [`LedgerError::MemberNotFound`], [`LedgerError::NotEligible`] when
/// the balance is below the cost, or any error from [`apply_adjustment`].
pub fn redeem<S>(
    snapshot: &mut LedgerSnapshot,
    store: &mut S,
    name: &str,
) -> Result<AdjustmentReceipt, LedgerError>
where
    S: LedgerStore + ?Sized,
{
    let member = snapshot.get(name).ok_or_else(|| LedgerError::MemberNotFound(name.to_string()))?;
    if !can_redeem(member.coin) {
        return Err(LedgerError::NotEligible {
            name: name.to_string(),
            coin: member.coin,
            cost: REDEMPTION_COST,
        });
    }

    apply_adjustment(
        snapshot,
        store,
        &Adjustment {
            name: name.to_string(),
            delta: -REDEMPTION_COST,
            reason: REDEMPTION_REASON.to_string(),
        },
    )
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LeaderboardEntry {
    pub name: String,
    pub coin: i64,
    pub membership_status: MembershipStatus,
}

/// Project every member, richest first; equal balances sort by name.
#[must_use]
pub fn leaderboard(snapshot: &LedgerSnapshot) -> Vec<LeaderboardEntry> {
    let mut entries = snapshot
        .members
        .iter()
        .map(|member| LeaderboardEntry {
            name: member.name.clone(),
            coin: member.coin,
            membership_status: member.membership_status,
        })
        .collect::<Vec<_>>();
    entries.sort_by(|lhs, rhs| rhs.coin.cmp(&lhs.coin).then_with(|| lhs.name.cmp(&rhs.name)));
    entries
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MemberView {
    pub name: String,
    pub coin: i64,
    pub role: String,
    pub membership_status: MembershipStatus,
    pub can_redeem: bool,
    pub redemption_cost: i64,
}

/// Self-service projection of one member.
///
/// # Errors
/// Returns [`LedgerError::MemberNotFound`] when `name` is not on the roster.
pub fn member_view(snapshot: &LedgerSnapshot, name: &str) -> Result<MemberView, LedgerError> {
    let member = snapshot.get(name).ok_or_else(|| LedgerError::MemberNotFound(name.to_string()))?;
    Ok(MemberView {
        name: member.name.clone(),
        coin: member.coin,
        role: member.role.clone(),
        membership_status: member.membership_status,
        can_redeem: can_redeem(member.coin),
        redemption_cost: REDEMPTION_COST,
    })
}

#[must_use]
pub fn roster(snapshot: &LedgerSnapshot) -> Vec<String> {
    snapshot.members.iter().map(|member| member.name.clone()).collect()
}
