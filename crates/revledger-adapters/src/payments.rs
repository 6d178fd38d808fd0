//! Payments/membership provider: bearer auth, cursor pagination.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use revledger_core::{non_empty, round_money, CustomerRef, MembershipRecord, PaymentRecord};
use revledger_storage::{retry_transient, HttpFetcher};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::{endpoint, parse_base_url, AdapterError, PaymentsSource};

const ADAPTER: &str = "payments";
pub const DEFAULT_BASE_URL: &str = "https://api.whop.com/api/v1";
const PAGE_SIZE: &str = "100";

#[derive(Debug, Clone)]
pub struct PaymentsCredentials {
    pub api_key: String,
    pub base_url: Option<String>,
}

#[derive(Debug)]
pub struct PaymentsClient {
    http: Arc<HttpFetcher>,
    base_url: Url,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(default)]
    page_info: Option<PageInfo>,
}

#[derive(Debug, Default, Deserialize)]
struct PageInfo {
    end_cursor: Option<String>,
    #[serde(default)]
    has_next_page: bool,
}

impl PageInfo {
    fn next_cursor(self) -> Option<String> {
        if self.has_next_page {
            self.end_cursor.filter(|c| !c.is_empty())
        } else {
            None
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ApiUser {
    id: Option<String>,
    email: Option<String>,
    name: Option<String>,
    username: Option<String>,
}

impl ApiUser {
    fn into_customer(self) -> CustomerRef {
        CustomerRef {
            email: non_empty(self.email.as_deref()),
            name: non_empty(self.name.as_deref()),
            username: non_empty(self.username.as_deref()),
            external_id: non_empty(self.id.as_deref()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiProduct {
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiPayment {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    substatus: Option<String>,
    #[serde(default)]
    total: Option<Decimal>,
    #[serde(default)]
    subtotal: Option<Decimal>,
    #[serde(default)]
    refunded_amount: Option<Decimal>,
    #[serde(default)]
    currency: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    paid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    user: Option<ApiUser>,
    #[serde(default)]
    product: Option<ApiProduct>,
}

impl From<ApiPayment> for PaymentRecord {
    fn from(p: ApiPayment) -> Self {
        let amount = round_money(p.total.unwrap_or(Decimal::ZERO));
        PaymentRecord {
            external_id: p.id,
            status: p.status.unwrap_or_default(),
            sub_status: non_empty(p.substatus.as_deref()),
            amount,
            amount_before_fees: p.subtotal.map_or(amount, round_money),
            refunded_amount: round_money(p.refunded_amount.unwrap_or(Decimal::ZERO)),
            currency: non_empty(p.currency.as_deref()),
            product: p.product.and_then(|prod| non_empty(prod.title.as_deref())),
            occurred_at: p.paid_at.unwrap_or(p.created_at).naive_utc(),
            customer: p.user.unwrap_or_default().into_customer(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiMembership {
    id: String,
    #[serde(default)]
    status: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    renewal_period_end: Option<DateTime<Utc>>,
    #[serde(default)]
    cancel_at_period_end: bool,
    #[serde(default)]
    user: Option<ApiUser>,
    #[serde(default)]
    product: Option<ApiProduct>,
}

impl From<ApiMembership> for MembershipRecord {
    fn from(m: ApiMembership) -> Self {
        MembershipRecord {
            external_id: m.id,
            status: m.status.unwrap_or_default(),
            product: m.product.and_then(|prod| non_empty(prod.title.as_deref())),
            cancel_at_period_end: m.cancel_at_period_end,
            renewal_period_end: m.renewal_period_end.map(|t| t.naive_utc()),
            created_at: m.created_at.naive_utc(),
            customer: m.user.unwrap_or_default().into_customer(),
        }
    }
}

impl PaymentsClient {
    pub fn new(http: Arc<HttpFetcher>, credentials: PaymentsCredentials) -> Result<Self, AdapterError> {
        if credentials.api_key.trim().is_empty() {
            return Err(AdapterError::config(ADAPTER, "api key is empty"));
        }
        let base_url = parse_base_url(
            ADAPTER,
            credentials.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
        )?;
        Ok(Self {
            http,
            base_url,
            api_key: credentials.api_key,
        })
    }

    /// Follows `page_info.end_cursor` until the provider reports no next page.
    async fn drain<T: DeserializeOwned>(
        &self,
        resource: &str,
        company_ref: &str,
    ) -> Result<Vec<T>, AdapterError> {
        let url = endpoint(ADAPTER, &self.base_url, &[resource])?;
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page: Page<T> = self
                .http
                .send_json(ADAPTER, retry_transient, |client| {
                    let mut request = client
                        .get(url.clone())
                        .bearer_auth(&self.api_key)
                        .query(&[("company_id", company_ref), ("first", PAGE_SIZE)]);
                    if let Some(after) = &cursor {
                        request = request.query(&[("after", after.as_str())]);
                    }
                    request
                })
                .await
                .map_err(AdapterError::fetch(ADAPTER))?;
            pages += 1;
            debug!(resource, pages, items = page.data.len(), "page received");
            items.extend(page.data);

            match page.page_info.and_then(PageInfo::next_cursor) {
                Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                    return Err(AdapterError::shape(
                        ADAPTER,
                        format!("{resource} cursor {next} did not advance"),
                    ));
                }
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        info!(resource, company_ref, pages, records = items.len(), "pagination drained");
        Ok(items)
    }
}

#[async_trait]
impl PaymentsSource for PaymentsClient {
    async fn fetch_payments(&self, company_ref: &str) -> Result<Vec<PaymentRecord>, AdapterError> {
        let raw: Vec<ApiPayment> = self.drain("payments", company_ref).await?;
        Ok(raw.into_iter().map(PaymentRecord::from).collect())
    }

    async fn fetch_memberships(
        &self,
        company_ref: &str,
    ) -> Result<Vec<MembershipRecord>, AdapterError> {
        let raw: Vec<ApiMembership> = self.drain("memberships", company_ref).await?;
        Ok(raw.into_iter().map(MembershipRecord::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fast_fetcher;
    use mockito::Matcher;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn client(server: &mockito::Server) -> PaymentsClient {
        PaymentsClient::new(
            fast_fetcher(),
            PaymentsCredentials {
                api_key: "sk_test".into(),
                base_url: Some(server.url()),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn payments_follow_cursor_until_last_page() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("GET", "/payments")
            .match_query(Matcher::Exact("company_id=biz_1&first=100".into()))
            .match_header("authorization", "Bearer sk_test")
            .with_body(
                json!({
                    "data": [{
                        "id": "pay_1",
                        "status": "paid",
                        "total": 100.0,
                        "subtotal": 97.5,
                        "refunded_amount": 20,
                        "created_at": "2024-01-01T10:00:00Z",
                        "user": { "id": "u_1", "email": "Ann@Example.com ", "name": "Ann" },
                        "product": { "title": "Coaching" }
                    }],
                    "page_info": { "end_cursor": "c1", "has_next_page": true }
                })
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("GET", "/payments")
            .match_query(Matcher::Exact("company_id=biz_1&first=100&after=c1".into()))
            .with_body(
                json!({
                    "data": [{
                        "id": "pay_2",
                        "status": "open",
                        "substatus": "succeeded",
                        "total": "50.00",
                        "created_at": "2024-01-02T10:00:00Z",
                        "paid_at": "2024-01-03T09:00:00Z"
                    }],
                    "page_info": { "end_cursor": "c2", "has_next_page": false }
                })
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;

        let payments = client(&server).fetch_payments("biz_1").await.unwrap();

        first.assert_async().await;
        second.assert_async().await;
        assert_eq!(payments.len(), 2);
        assert_eq!(payments[0].amount, dec!(100));
        assert_eq!(payments[0].amount_before_fees, dec!(97.5));
        assert_eq!(payments[0].refunded_amount, dec!(20));
        assert_eq!(payments[0].product.as_deref(), Some("Coaching"));
        assert_eq!(payments[0].customer.email.as_deref(), Some("Ann@Example.com"));
        assert_eq!(payments[1].sub_status.as_deref(), Some("succeeded"));
        assert_eq!(payments[1].amount_before_fees, dec!(50));
        assert_eq!(payments[1].occurred_at.to_string(), "2024-01-03 09:00:00");
    }

    #[tokio::test]
    async fn unauthorized_fails_without_retry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/memberships")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body("{\"error\":\"invalid token\"}")
            .expect(1)
            .create_async()
            .await;

        let err = client(&server).fetch_memberships("biz_1").await.unwrap_err();

        mock.assert_async().await;
        assert_eq!(err.status(), Some(401));
        assert!(matches!(err, AdapterError::Fetch { adapter: "payments", .. }));
    }

    #[tokio::test]
    async fn memberships_map_renewal_and_cancel_flags() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/memberships")
            .match_query(Matcher::Any)
            .with_body(
                json!({
                    "data": [{
                        "id": "mem_1",
                        "status": "active",
                        "created_at": "2024-02-01T00:00:00Z",
                        "renewal_period_end": "2024-03-01T00:00:00Z",
                        "cancel_at_period_end": true,
                        "user": { "email": "b@example.com", "username": "bee" }
                    }]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let memberships = client(&server).fetch_memberships("biz_1").await.unwrap();

        assert_eq!(memberships.len(), 1);
        assert!(memberships[0].cancel_at_period_end);
        assert!(memberships[0].renewal_period_end.is_some());
        assert_eq!(memberships[0].customer.username.as_deref(), Some("bee"));
    }

    #[tokio::test]
    async fn repeated_cursor_is_a_data_shape_error() {
        let mut server = mockito::Server::new_async().await;
        let page = json!({
            "data": [],
            "page_info": { "end_cursor": "same", "has_next_page": true }
        })
        .to_string();
        server
            .mock("GET", "/payments")
            .match_query(Matcher::Any)
            .with_body(page)
            .create_async()
            .await;

        let err = client(&server).fetch_payments("biz_1").await.unwrap_err();
        assert!(matches!(err, AdapterError::DataShape { .. }));
    }

    #[test]
    fn empty_api_key_is_rejected() {
        let err = PaymentsClient::new(
            fast_fetcher(),
            PaymentsCredentials {
                api_key: " ".into(),
                base_url: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, AdapterError::Config { .. }));
    }
}
