//! CRM API adapter: contact search, opportunities, appointments and pipeline
//! reference data. Every call carries the bearer token and the fixed API version.

use std::sync::Arc;

use async_trait::async_trait;
use revledger_core::{
    non_empty, normalize_email, normalize_email_opt, round_money, CrmAppointmentRecord,
    CrmContactRecord, CrmOpportunityRecord, CrmPipelineRecord, CrmStageRecord,
};
use revledger_storage::{retry_transient_or_rate_limited, FetchError, HttpFetcher};
use reqwest::RequestBuilder;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::{endpoint, parse_base_url, parse_datetime, AdapterError, CrmSource};

/// Source id for fetch concurrency and rate limits.
pub const ADAPTER: &str = "crm";
pub const DEFAULT_BASE_URL: &str = "https://services.leadconnectorhq.com";
pub const API_VERSION: &str = "2021-07-28";
const OPPORTUNITY_PAGE_LIMIT: usize = 100;
const MAX_OPPORTUNITY_PAGES: u32 = 50;

#[derive(Debug, Clone)]
pub struct CrmCredentials {
    pub api_key: String,
    pub location_id: String,
    pub base_url: Option<String>,
}

#[derive(Debug)]
pub struct CrmClient {
    http: Arc<HttpFetcher>,
    base_url: Url,
    api_key: String,
    location_id: String,
}

#[derive(Debug, Serialize)]
struct EqFilter<'a> {
    field: &'static str,
    operator: &'static str,
    value: &'a str,
}

impl<'a> EqFilter<'a> {
    fn new(field: &'static str, value: &'a str) -> Self {
        Self {
            field,
            operator: "eq",
            value,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContactSearchRequest<'a> {
    location_id: &'a str,
    page_limit: u32,
    filters: [EqFilter<'a>; 1],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OpportunitySearchRequest<'a> {
    location_id: &'a str,
    page: u32,
    limit: usize,
    filters: [EqFilter<'a>; 1],
}

#[derive(Debug, Deserialize)]
struct ContactSearchResponse {
    #[serde(default)]
    contacts: Vec<ApiContact>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiContact {
    id: String,
    first_name: Option<String>,
    last_name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    date_added: Option<String>,
}

impl From<ApiContact> for CrmContactRecord {
    fn from(c: ApiContact) -> Self {
        CrmContactRecord {
            external_id: c.id,
            first_name: non_empty(c.first_name.as_deref()),
            last_name: non_empty(c.last_name.as_deref()),
            email: non_empty(c.email.as_deref()),
            phone: non_empty(c.phone.as_deref()),
            tags: c.tags,
            created_at: c.date_added.as_deref().and_then(parse_datetime),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpportunitySearchResponse {
    #[serde(default)]
    opportunities: Vec<ApiOpportunity>,
}

#[derive(Debug, Deserialize)]
struct OpportunityDetailResponse {
    opportunity: Option<ApiOpportunity>,
}

#[derive(Debug, Deserialize)]
struct ApiContactRef {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiOpportunity {
    id: String,
    name: Option<String>,
    status: Option<String>,
    monetary_value: Option<Decimal>,
    pipeline_id: Option<String>,
    pipeline_stage_id: Option<String>,
    assigned_to: Option<String>,
    created_at: Option<String>,
    contact_id: Option<String>,
    contact: Option<ApiContactRef>,
}

impl ApiOpportunity {
    fn into_record(self, contact_external_id: Option<&str>) -> CrmOpportunityRecord {
        let contact_external_id = contact_external_id
            .map(ToString::to_string)
            .or(self.contact_id)
            .or(self.contact.and_then(|c| c.id))
            .unwrap_or_default();
        CrmOpportunityRecord {
            external_id: self.id,
            contact_external_id,
            name: non_empty(self.name.as_deref()),
            status: non_empty(self.status.as_deref()),
            monetary_value: round_money(self.monetary_value.unwrap_or(Decimal::ZERO)),
            pipeline_id: non_empty(self.pipeline_id.as_deref()),
            stage_id: non_empty(self.pipeline_stage_id.as_deref()),
            assigned_to: non_empty(self.assigned_to.as_deref()),
            created_at: self.created_at.as_deref().and_then(parse_datetime),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AppointmentsResponse {
    #[serde(default)]
    events: Vec<ApiAppointment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiAppointment {
    id: String,
    title: Option<String>,
    appointment_status: Option<String>,
    status: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    assigned_user_id: Option<String>,
}

impl From<ApiAppointment> for CrmAppointmentRecord {
    fn from(a: ApiAppointment) -> Self {
        CrmAppointmentRecord {
            external_id: a.id,
            title: non_empty(a.title.as_deref()),
            status: non_empty(a.appointment_status.as_deref()).or(non_empty(a.status.as_deref())),
            start_time: a.start_time.as_deref().and_then(parse_datetime),
            end_time: a.end_time.as_deref().and_then(parse_datetime),
            assigned_user_id: non_empty(a.assigned_user_id.as_deref()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PipelinesResponse {
    #[serde(default)]
    pipelines: Vec<ApiPipeline>,
}

#[derive(Debug, Deserialize)]
struct ApiPipeline {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    stages: Vec<ApiStage>,
}

#[derive(Debug, Deserialize)]
struct ApiStage {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    position: Option<i32>,
}

impl From<ApiPipeline> for CrmPipelineRecord {
    fn from(p: ApiPipeline) -> Self {
        CrmPipelineRecord {
            external_id: p.id,
            name: p.name,
            stages: p
                .stages
                .into_iter()
                .enumerate()
                .map(|(idx, s)| CrmStageRecord {
                    external_id: s.id,
                    name: s.name,
                    position: s.position.unwrap_or(idx as i32),
                })
                .collect(),
        }
    }
}

impl CrmClient {
    pub fn new(http: Arc<HttpFetcher>, credentials: CrmCredentials) -> Result<Self, AdapterError> {
        if credentials.api_key.trim().is_empty() {
            return Err(AdapterError::config(ADAPTER, "api key is empty"));
        }
        if credentials.location_id.trim().is_empty() {
            return Err(AdapterError::config(ADAPTER, "location id is empty"));
        }
        let base_url = parse_base_url(
            ADAPTER,
            credentials.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
        )?;
        Ok(Self {
            http,
            base_url,
            api_key: credentials.api_key,
            location_id: credentials.location_id,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(&self.api_key)
            .header("Version", API_VERSION)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        self.http
            .send_json(ADAPTER, retry_transient_or_rate_limited, |client| {
                self.authorized(client.get(url.clone()).query(query))
            })
            .await
    }

    async fn post<T, B>(&self, url: Url, body: &B) -> Result<T, FetchError>
    where
        T: serde::de::DeserializeOwned,
        B: Serialize + Sync,
    {
        self.http
            .send_json(ADAPTER, retry_transient_or_rate_limited, |client| {
                self.authorized(client.post(url.clone()).json(body))
            })
            .await
    }
}

#[async_trait]
impl CrmSource for CrmClient {
    async fn search_contact_by_email(
        &self,
        email: &str,
    ) -> Result<Option<CrmContactRecord>, AdapterError> {
        let url = endpoint(ADAPTER, &self.base_url, &["contacts", "search"])?;
        let body = ContactSearchRequest {
            location_id: &self.location_id,
            page_limit: 1,
            filters: [EqFilter::new("email", email)],
        };
        let response: ContactSearchResponse = self
            .post(url, &body)
            .await
            .map_err(AdapterError::fetch(ADAPTER))?;
        let wanted = normalize_email(email);
        let contact = response
            .contacts
            .into_iter()
            .next()
            .map(CrmContactRecord::from)
            .filter(|c| wanted.is_some() && normalize_email_opt(c.email.as_deref()) == wanted);
        Ok(contact)
    }

    async fn search_opportunities(
        &self,
        contact_external_id: &str,
    ) -> Result<Vec<CrmOpportunityRecord>, AdapterError> {
        let url = endpoint(ADAPTER, &self.base_url, &["opportunities", "search"])?;
        let mut records = Vec::new();

        for page in 1..=MAX_OPPORTUNITY_PAGES {
            let body = OpportunitySearchRequest {
                location_id: &self.location_id,
                page,
                limit: OPPORTUNITY_PAGE_LIMIT,
                filters: [EqFilter::new("contact_id", contact_external_id)],
            };
            let response: OpportunitySearchResponse = self
                .post(url.clone(), &body)
                .await
                .map_err(AdapterError::fetch(ADAPTER))?;
            let received = response.opportunities.len();
            records.extend(
                response
                    .opportunities
                    .into_iter()
                    .map(|o| o.into_record(Some(contact_external_id))),
            );
            debug!(contact_external_id, page, received, "opportunity page received");
            if received < OPPORTUNITY_PAGE_LIMIT {
                return Ok(records);
            }
        }

        warn!(
            contact_external_id,
            max_pages = MAX_OPPORTUNITY_PAGES,
            "opportunity search hit the page cap"
        );
        Ok(records)
    }

    async fn get_opportunity(
        &self,
        opportunity_id: &str,
    ) -> Result<Option<CrmOpportunityRecord>, AdapterError> {
        let url = endpoint(ADAPTER, &self.base_url, &["opportunities", opportunity_id])?;
        match self.get::<OpportunityDetailResponse>(url, &[]).await {
            Ok(response) => Ok(response.opportunity.map(|o| o.into_record(None))),
            Err(err) if err.status() == Some(404) => Ok(None),
            Err(err) => Err(AdapterError::Fetch {
                adapter: ADAPTER,
                error: err,
            }),
        }
    }

    async fn list_appointments(
        &self,
        contact_external_id: &str,
    ) -> Result<Vec<CrmAppointmentRecord>, AdapterError> {
        let url = endpoint(
            ADAPTER,
            &self.base_url,
            &["contacts", contact_external_id, "appointments"],
        )?;
        let response: AppointmentsResponse = self
            .get(url, &[])
            .await
            .map_err(AdapterError::fetch(ADAPTER))?;
        Ok(response
            .events
            .into_iter()
            .map(CrmAppointmentRecord::from)
            .collect())
    }

    async fn list_pipelines(&self) -> Result<Vec<CrmPipelineRecord>, AdapterError> {
        let url = endpoint(ADAPTER, &self.base_url, &["opportunities", "pipelines"])?;
        let response: PipelinesResponse = self
            .get(url, &[("locationId", self.location_id.as_str())])
            .await
            .map_err(AdapterError::fetch(ADAPTER))?;
        Ok(response
            .pipelines
            .into_iter()
            .map(CrmPipelineRecord::from)
            .collect())
    }
}
