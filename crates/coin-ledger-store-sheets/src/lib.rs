//! Spreadsheet-service ledger store over the Google Sheets v4 values API.
//!
//! The service has no partial-row primitive we rely on: `read_all` fetches the
//! whole value range and `write_all` overwrites it from the top, then clears
//! whatever rows sit below the new table. The overwrite goes first so a failed
//! write leaves the previous table readable.
//!
//! Without an explicit range the store targets the spreadsheet's first
//! worksheet, whatever its title.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use coin_ledger_core::{LedgerStore, LedgerTable, LEDGER_HEADER};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

pub mod credentials;
#[cfg(test)]
mod test_support;

pub use credentials::{
    resolve_credentials, CredentialKind, CredentialSource, SheetsCredentials, DEFAULT_KEY_FILE,
    DEFAULT_SECRET_NAME, SHEETS_SCOPE,
};

pub const DEFAULT_API_BASE: &str = "https://sheets.googleapis.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const COIN_COLUMN: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetsConfig {
    pub api_base: String,
    pub spreadsheet_id: String,
    /// Worksheet title or A1 range anchored at `A1`; `None` means the first
    /// worksheet.
    pub range: Option<String>,
}

impl SheetsConfig {
    #[must_use]
    pub fn new(spreadsheet_id: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            spreadsheet_id: spreadsheet_id.into(),
            range: None,
        }
    }

    #[must_use]
    pub fn with_range(mut self, range: impl Into<String>) -> Self {
        self.range = Some(range.into());
        self
    }
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMetadata {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
}

#[derive(Debug)]
pub struct SheetsLedgerStore {
    agent: ureq::Agent,
    config: SheetsConfig,
    credentials: SheetsCredentials,
    first_sheet: OnceLock<String>,
}

impl SheetsLedgerStore {
    #[must_use]
    pub fn new(config: SheetsConfig, credentials: SheetsCredentials) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Self { agent, config, credentials, first_sheet: OnceLock::new() }
    }

    #[must_use]
    pub fn config(&self) -> &SheetsConfig {
        &self.config
    }

    /// The configured range, or the first worksheet's title looked up once.
    fn range(&self) -> Result<String> {
        if let Some(range) = &self.config.range {
            return Ok(range.clone());
        }
        if let Some(title) = self.first_sheet.get() {
            return Ok(title.clone());
        }
        let title = self.first_sheet_title()?;
        Ok(self.first_sheet.get_or_init(|| title).clone())
    }

    fn first_sheet_title(&self) -> Result<String> {
        let mut url = spreadsheet_url(&self.config.api_base, &self.config.spreadsheet_id, &[])?;
        url.query_pairs_mut().append_pair("fields", "sheets.properties.title");

        let response = self
            .agent
            .get(url.as_str())
            .set("Authorization", &self.credentials.bearer(&self.agent)?)
            .call()
            .map_err(describe_http_error)
            .with_context(|| {
                format!("failed to read worksheets of spreadsheet {}", self.config.spreadsheet_id)
            })?;
        let metadata: SpreadsheetMetadata =
            response.into_json().context("failed to decode spreadsheet metadata response")?;

        metadata.sheets.into_iter().next().map(|sheet| sheet.properties.title).ok_or_else(|| {
            anyhow!("spreadsheet {} has no worksheets", self.config.spreadsheet_id)
        })
    }

    fn fetch_table(&self) -> Result<LedgerTable> {
        let range = self.range()?;
        let mut url = self.values_url(&range, None)?;
        url.query_pairs_mut()
            .append_pair("majorDimension", "ROWS")
            .append_pair("valueRenderOption", "UNFORMATTED_VALUE");

        let response = self
            .agent
            .get(url.as_str())
            .set("Authorization", &self.credentials.bearer(&self.agent)?)
            .call()
            .map_err(describe_http_error)
            .with_context(|| format!("failed to read range {range}"))?;
        let body: ValueRange =
            response.into_json().context("failed to decode spreadsheet values response")?;

        Ok(values_to_table(body.values))
    }

    fn replace_table(&self, table: &LedgerTable) -> Result<()> {
        let range = self.range()?;
        let values = table_to_values(table);
        let written_rows = values.len();

        let mut update_url = self.values_url(&range, None)?;
        update_url.query_pairs_mut().append_pair("valueInputOption", "RAW");
        self.agent
            .put(update_url.as_str())
            .set("Authorization", &self.credentials.bearer(&self.agent)?)
            .send_json(serde_json::json!({
                "range": range,
                "majorDimension": "ROWS",
                "values": values,
            }))
            .map_err(describe_http_error)
            .with_context(|| format!("failed to write range {range}"))?;

        // Rows below the new table belong to members that no longer exist.
        let tail = tail_range(&range, written_rows + 1, last_column(table));
        let clear_url = self.values_url(&tail, Some("clear"))?;
        self.agent
            .post(clear_url.as_str())
            .set("Authorization", &self.credentials.bearer(&self.agent)?)
            .send_json(serde_json::json!({}))
            .map_err(describe_http_error)
            .with_context(|| format!("failed to clear stale rows {tail}"))?;

        Ok(())
    }

    fn values_url(&self, range: &str, action: Option<&str>) -> Result<Url> {
        values_url(&self.config.api_base, &self.config.spreadsheet_id, range, action)
    }
}

impl LedgerStore for SheetsLedgerStore {
    type Error = anyhow::Error;

    fn read_all(&self) -> Result<LedgerTable> {
        self.fetch_table()
    }

    fn write_all(&mut self, table: &LedgerTable) -> Result<()> {
        self.replace_table(table)
    }
}

/// Build `{base}/v4/spreadsheets/{id}[/{extra}...]` with each path segment
/// percent-encoded.
fn spreadsheet_url(api_base: &str, spreadsheet_id: &str, extra: &[&str]) -> Result<Url> {
    let mut url =
        Url::parse(api_base).with_context(|| format!("invalid spreadsheet api base {api_base}"))?;
    url.path_segments_mut()
        .map_err(|()| anyhow!("spreadsheet api base cannot carry a path: {api_base}"))?
        .pop_if_empty()
        .extend(["v4", "spreadsheets", spreadsheet_id])
        .extend(extra);
    Ok(url)
}

/// `{base}/v4/spreadsheets/{id}/values/{range}[:{action}]`.
fn values_url(
    api_base: &str,
    spreadsheet_id: &str,
    range: &str,
    action: Option<&str>,
) -> Result<Url> {
    let range_segment = match action {
        Some(action) => format!("{range}:{action}"),
        None => range.to_string(),
    };
    spreadsheet_url(api_base, spreadsheet_id, &["values", range_segment.as_str()])
}

/// A1 range covering every row from `first_row` down, on the worksheet that
/// `range` names.
fn tail_range(range: &str, first_row: usize, last_column: char) -> String {
    let title = range.split_once('!').map_or(range, |(title, _)| title);
    format!("{}!A{first_row}:{last_column}", quote_sheet_title(title))
}

fn quote_sheet_title(title: &str) -> String {
    if title.len() >= 2 && title.starts_with('\'') && title.ends_with('\'') {
        return title.to_string();
    }
    format!("'{}'", title.replace('\'', "''"))
}

fn last_column(table: &LedgerTable) -> char {
    let width = table
        .rows
        .iter()
        .map(Vec::len)
        .chain([table.header.len(), LEDGER_HEADER.len()])
        .max()
        .unwrap_or(LEDGER_HEADER.len())
        .clamp(1, 26);
    char::from(b'A' + u8::try_from(width - 1).unwrap_or(25))
}

fn values_to_table(values: Vec<Vec<Value>>) -> LedgerTable {
    let mut rows =
        values.into_iter().map(|row| row.iter().map(cell_to_string).collect::<Vec<String>>());
    let header = rows.next().unwrap_or_default();
    LedgerTable { header, rows: rows.collect() }
}

fn cell_to_string(cell: &Value) -> String {
    match cell {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(number) => number.to_string(),
        other => other.to_string(),
    }
}

/// Coin cells go out as numbers so the sheet keeps numeric typing.
fn table_to_values(table: &LedgerTable) -> Vec<Vec<Value>> {
    let header = table.header.iter().cloned().map(Value::String).collect::<Vec<_>>();
    let rows = table.rows.iter().map(|row| {
        row.iter()
            .enumerate()
            .map(|(column, cell)| match cell.trim().parse::<i64>() {
                Ok(number) if column == COIN_COLUMN => Value::from(number),
                _ => Value::String(cell.clone()),
            })
            .collect::<Vec<_>>()
    });
    std::iter::once(header).chain(rows).collect()
}

pub(crate) fn describe_http_error(err: ureq::Error) -> anyhow::Error {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            anyhow!("spreadsheet service returned HTTP {code}: {}", body.trim())
        }
        ureq::Error::Transport(transport) => {
            anyhow!("spreadsheet service unreachable: {transport}")
        }
    }
}
