//! Pure mappers from decoded upload rows to sale records.

use std::collections::BTreeMap;

use revledger_core::{non_empty, normalize_email, ElectiveRecord, FanbasisRecord};
use serde::Serialize;
use tracing::debug;

use crate::{parse_amount, parse_datetime};

/// One decoded CSV/XLSX row: header -> cell text.
pub type DecodedRow = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadMapping<T> {
    pub records: Vec<T>,
    pub skipped_missing_email: usize,
    pub skipped_bad_date: usize,
}

impl<T> Default for UploadMapping<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            skipped_missing_email: 0,
            skipped_bad_date: 0,
        }
    }
}

/// Cell by exact header, falling back to a trimmed case-insensitive match.
fn column<'a>(row: &'a DecodedRow, header: &str) -> Option<&'a str> {
    row.get(header)
        .or_else(|| {
            row.iter()
                .find(|(k, _)| k.trim().eq_ignore_ascii_case(header))
                .map(|(_, v)| v)
        })
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn amount(row: &DecodedRow, header: &str) -> rust_decimal::Decimal {
    parse_amount(column(row, header).unwrap_or_default())
}

fn map_rows<T>(
    kind: &'static str,
    rows: &[DecodedRow],
    email_header: &str,
    date_header: &str,
    mut build: impl FnMut(&DecodedRow, String, chrono::NaiveDateTime) -> T,
) -> UploadMapping<T> {
    let mut mapping = UploadMapping::default();
    for (idx, row) in rows.iter().enumerate() {
        let Some(email) = column(row, email_header).and_then(normalize_email) else {
            debug!(kind, row = idx + 1, "upload row without email dropped");
            mapping.skipped_missing_email += 1;
            continue;
        };
        let Some(sale_date) = column(row, date_header).and_then(parse_datetime) else {
            debug!(kind, row = idx + 1, "upload row with unparseable date dropped");
            mapping.skipped_bad_date += 1;
            continue;
        };
        mapping.records.push(build(row, email, sale_date));
    }
    mapping
}

pub fn map_elective_rows(rows: &[DecodedRow]) -> UploadMapping<ElectiveRecord> {
    map_rows("elective", rows, "Email", "Sale Date", |row, email, sale_date| {
        ElectiveRecord {
            sale_date,
            customer_email: email,
            customer_name: non_empty(column(row, "Customer")),
            net_amount: amount(row, "Net Amount"),
        }
    })
}

pub fn map_fanbasis_rows(rows: &[DecodedRow]) -> UploadMapping<FanbasisRecord> {
    map_rows("fanbasis", rows, "Customer Email", "Date", |row, email, sale_date| {
        FanbasisRecord {
            sale_date,
            customer_email: email,
            customer_name: non_empty(column(row, "Customer Name")),
            amount: amount(row, "Amount"),
            net_amount: amount(row, "Net Amount"),
            status: non_empty(column(row, "Status")),
            product: non_empty(column(row, "Product")),
            discount_code: non_empty(column(row, "Discount Code")),
            discount_amount: amount(row, "Discount Amount"),
            payment_method: non_empty(column(row, "Payment Method")),
        }
    })
}
