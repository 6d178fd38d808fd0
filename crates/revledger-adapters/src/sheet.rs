//! "Cash collected" spreadsheet adapter.

use std::sync::Arc;

use async_trait::async_trait;
use revledger_core::SheetRecord;
use revledger_storage::{retry_transient, HttpFetcher};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::{endpoint, parse_amount, parse_base_url, parse_date, AdapterError, SheetSource};

const ADAPTER: &str = "sheet";
pub const DEFAULT_BASE_URL: &str = "https://sheets.googleapis.com/v4/spreadsheets";
pub const DEFAULT_RANGE: &str = "Cash Collected!A:Z";

/// Headers read from row 1, in the order they map onto [`SheetRecord`] fields.
pub const SHEET_HEADERS: [&str; 9] = [
    "Date",
    "Type",
    "Contact Name",
    "Contact Email",
    "Amount",
    "Platform",
    "Closer",
    "Setter",
    "Notes",
];

#[derive(Debug)]
pub struct SheetsClient {
    http: Arc<HttpFetcher>,
    base_url: Url,
    api_key: String,
    range: String,
}

#[derive(Debug, Deserialize)]
struct ValuesResponse {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

impl SheetsClient {
    pub fn new(
        http: Arc<HttpFetcher>,
        api_key: String,
        range: Option<String>,
        base_url: Option<&str>,
    ) -> Result<Self, AdapterError> {
        if api_key.trim().is_empty() {
            return Err(AdapterError::config(ADAPTER, "api key is empty"));
        }
        Ok(Self {
            http,
            base_url: parse_base_url(ADAPTER, base_url.unwrap_or(DEFAULT_BASE_URL))?,
            api_key,
            range: range
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_RANGE.to_string()),
        })
    }
}

#[async_trait]
impl SheetSource for SheetsClient {
    async fn fetch_sheet_rows(&self, sheet_url: &str) -> Result<Vec<SheetRecord>, AdapterError> {
        let id = spreadsheet_id(sheet_url)?;
        let url = endpoint(ADAPTER, &self.base_url, &[id.as_str(), "values", self.range.as_str()])?;
        let response: ValuesResponse = self
            .http
            .send_json(ADAPTER, retry_transient, |client| {
                client.get(url.clone()).query(&[("key", self.api_key.as_str())])
            })
            .await
            .map_err(AdapterError::fetch(ADAPTER))?;

        let records = map_sheet_grid(response.values)?;
        info!(spreadsheet = %id, range = %self.range, rows = records.len(), "sheet read");
        Ok(records)
    }
}

/// Spreadsheet id from a `.../spreadsheets/d/<id>/...` URL.
pub fn spreadsheet_id(sheet_url: &str) -> Result<String, AdapterError> {
    let url = Url::parse(sheet_url.trim())
        .map_err(|err| AdapterError::shape(ADAPTER, format!("unparseable sheet url {sheet_url}: {err}")))?;
    let mut segments = url.path_segments().into_iter().flatten();
    while let Some(segment) = segments.next() {
        if segment == "d" {
            if let Some(id) = segments.next().filter(|id| !id.is_empty()) {
                return Ok(id.to_string());
            }
        }
    }
    Err(AdapterError::shape(
        ADAPTER,
        format!("no spreadsheet id in {sheet_url}"),
    ))
}

/// Maps a raw grid onto records. Row 1 is headers; a header that appears more
/// than once resolves to its right-most column; a missing header reads as empty.
pub fn map_sheet_grid(grid: Vec<Vec<String>>) -> Result<Vec<SheetRecord>, AdapterError> {
    let mut rows = grid.into_iter();
    let headers = rows
        .next()
        .ok_or_else(|| AdapterError::shape(ADAPTER, "sheet is empty"))?;

    let columns: Vec<Option<usize>> = SHEET_HEADERS
        .iter()
        .map(|name| {
            headers
                .iter()
                .rposition(|h| h.trim().eq_ignore_ascii_case(name))
        })
        .collect();
    if columns.iter().all(Option::is_none) {
        return Err(AdapterError::shape(
            ADAPTER,
            format!("none of the expected headers {SHEET_HEADERS:?} are present"),
        ));
    }
    for (name, column) in SHEET_HEADERS.iter().zip(&columns) {
        if column.is_none() {
            debug!(header = *name, "sheet header missing; column reads as empty");
        }
    }

    let mut records = Vec::new();
    for (idx, row) in rows.enumerate() {
        if row.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        let cell = |field: usize| -> String {
            columns[field]
                .and_then(|col| row.get(col))
                .map(|v| v.trim().to_string())
                .unwrap_or_default()
        };
        let raw_date = cell(0);
        records.push(SheetRecord {
            row_number: idx as i32 + 1,
            entry_date: parse_date(&raw_date),
            entry_type: cell(1),
            contact_name: cell(2),
            contact_email: cell(3),
            amount: parse_amount(&cell(4)),
            platform: cell(5),
            closer: cell(6),
            setter: cell(7),
            notes: cell(8),
        });
    }

    if records.is_empty() {
        return Err(AdapterError::shape(ADAPTER, "sheet has no data rows"));
    }
    Ok(records)
}
