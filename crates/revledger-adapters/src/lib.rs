//! Source adapter contracts and the HTTP/flat-file adapters behind them.
//!
//! Everything past this crate sees typed records from `revledger_core`; raw API
//! payloads are decoded here and never leave.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use revledger_core::{
    CrmAppointmentRecord, CrmContactRecord, CrmOpportunityRecord, CrmPipelineRecord,
    MembershipRecord, PaymentRecord, SheetRecord,
};
use revledger_storage::FetchError;
use rust_decimal::Decimal;
use thiserror::Error;
use url::Url;

pub mod crm;
pub mod payments;
pub mod sheet;
pub mod uploads;

pub use crm::{CrmClient, CrmCredentials};
pub use payments::{PaymentsClient, PaymentsCredentials};
pub use sheet::{map_sheet_grid, spreadsheet_id, SheetsClient, SHEET_HEADERS};
pub use uploads::{map_elective_rows, map_fanbasis_rows, DecodedRow, UploadMapping};

pub const CRATE_NAME: &str = "revledger-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{adapter} request failed: {error}")]
    Fetch {
        adapter: &'static str,
        #[source]
        error: FetchError,
    },
    #[error("{adapter}: {message}")]
    DataShape {
        adapter: &'static str,
        message: String,
    },
    #[error("{adapter} configuration: {message}")]
    Config {
        adapter: &'static str,
        message: String,
    },
}

impl AdapterError {
    pub(crate) fn fetch(adapter: &'static str) -> impl FnOnce(FetchError) -> Self {
        move |error| AdapterError::Fetch { adapter, error }
    }

    pub(crate) fn shape(adapter: &'static str, message: impl Into<String>) -> Self {
        AdapterError::DataShape {
            adapter,
            message: message.into(),
        }
    }

    pub(crate) fn config(adapter: &'static str, message: impl Into<String>) -> Self {
        AdapterError::Config {
            adapter,
            message: message.into(),
        }
    }

    /// HTTP status of the underlying failure, when there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            AdapterError::Fetch { error, .. } => error.status(),
            _ => None,
        }
    }
}

/// Payments/membership provider. Each call drains every page before returning.
#[async_trait]
pub trait PaymentsSource: Send + Sync {
    async fn fetch_payments(&self, company_ref: &str) -> Result<Vec<PaymentRecord>, AdapterError>;

    async fn fetch_memberships(
        &self,
        company_ref: &str,
    ) -> Result<Vec<MembershipRecord>, AdapterError>;
}

#[async_trait]
pub trait CrmSource: Send + Sync {
    /// Exactly one contact by exact-match email, or `None`.
    async fn search_contact_by_email(
        &self,
        email: &str,
    ) -> Result<Option<CrmContactRecord>, AdapterError>;

    async fn search_opportunities(
        &self,
        contact_external_id: &str,
    ) -> Result<Vec<CrmOpportunityRecord>, AdapterError>;

    /// Detail fetch used to backfill pipeline/stage ids.
    async fn get_opportunity(
        &self,
        opportunity_id: &str,
    ) -> Result<Option<CrmOpportunityRecord>, AdapterError>;

    async fn list_appointments(
        &self,
        contact_external_id: &str,
    ) -> Result<Vec<CrmAppointmentRecord>, AdapterError>;

    async fn list_pipelines(&self) -> Result<Vec<CrmPipelineRecord>, AdapterError>;
}

/// One named range of a spreadsheet; all rows or an error, never a partial read.
#[async_trait]
pub trait SheetSource: Send + Sync {
    async fn fetch_sheet_rows(&self, sheet_url: &str) -> Result<Vec<SheetRecord>, AdapterError>;
}

/// `base` with `segments` appended as percent-encoded path segments.
pub(crate) fn endpoint(
    adapter: &'static str,
    base: &Url,
    segments: &[&str],
) -> Result<Url, AdapterError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| AdapterError::config(adapter, format!("{base} cannot be a base url")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

pub(crate) fn parse_base_url(adapter: &'static str, raw: &str) -> Result<Url, AdapterError> {
    Url::parse(raw).map_err(|err| AdapterError::config(adapter, format!("invalid base url {raw}: {err}")))
}

/// Keeps digits, `.` and `-`, then parses to cents; anything unparseable is zero.
pub fn parse_amount(raw: &str) -> Decimal {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    Decimal::from_str(&cleaned).map_or(Decimal::ZERO, revledger_core::round_money)
}

const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%m/%d/%Y %H:%M", "%Y-%m-%dT%H:%M:%S"];
const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%m/%d/%Y"];

/// Timestamp from an API or a flat file, as naive UTC wall time.
///
/// RFC3339 values are converted to UTC; naive values are taken as-is; bare dates
/// land on midnight.
pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.naive_utc());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| parse_date(raw).and_then(|d| d.and_hms_opt(0, 0, 0)))
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use revledger_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};

    pub fn fast_fetcher() -> Arc<HttpFetcher> {
        Arc::new(
            HttpFetcher::new(HttpClientConfig {
                backoff: BackoffPolicy {
                    max_retries: 2,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(4),
                },
                ..Default::default()
            })
            .unwrap(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn amounts_strip_currency_noise() {
        assert_eq!(parse_amount("$1,234.50"), dec!(1234.50));
        assert_eq!(parse_amount(" -20 USD"), dec!(-20));
        assert_eq!(parse_amount("n/a"), Decimal::ZERO);
        assert_eq!(parse_amount(""), Decimal::ZERO);
        assert_eq!(parse_amount("99.995"), dec!(100.00));
    }

    #[test]
    fn datetimes_accept_every_supported_layout() {
        let noon = NaiveDate::from_ymd_opt(2024, 1, 5)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        assert_eq!(parse_datetime("2024-01-05T12:00:00Z"), Some(noon));
        assert_eq!(parse_datetime("2024-01-05T14:00:00+02:00"), Some(noon));
        assert_eq!(parse_datetime("2024-01-05 12:00:00"), Some(noon));
        assert_eq!(parse_datetime("01/05/2024 12:00"), Some(noon));
        assert_eq!(
            parse_datetime("01/05/2024"),
            NaiveDate::from_ymd_opt(2024, 1, 5).unwrap().and_hms_opt(0, 0, 0)
        );
        assert_eq!(parse_datetime("yesterday"), None);
    }

    #[test]
    fn endpoint_percent_encodes_segments() {
        let base = Url::parse("https://sheets.example.com/v4/spreadsheets").unwrap();
        let url = endpoint("sheet", &base, &["abc", "values", "Cash Collected!A:Z"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://sheets.example.com/v4/spreadsheets/abc/values/Cash%20Collected!A:Z"
        );
    }
}
