//! Process configuration and the per-company registry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use revledger_core::Company;
use revledger_adapters::crm;
use revledger_storage::{BackoffPolicy, HttpClientConfig, RateLimit};
use serde::Deserialize;
use tokio::fs;
use uuid::Uuid;

use crate::SyncError;

const ENV_PREFIX: &str = "env:";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub companies_file: PathBuf,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub http_base_delay_ms: u64,
    pub crm_batch_size: usize,
    pub crm_batch_pause_ms: u64,
    /// CRM requests per second across all companies; 0 leaves it unlimited.
    pub crm_rate_per_sec: u32,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            companies_file: lookup("REVLEDGER_COMPANIES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("companies.yaml")),
            http_timeout_secs: number("REVLEDGER_HTTP_TIMEOUT_SECS", 20),
            http_max_retries: number("REVLEDGER_HTTP_MAX_RETRIES", 3) as usize,
            http_base_delay_ms: number("REVLEDGER_HTTP_BASE_DELAY_MS", 500),
            crm_batch_size: (number("REVLEDGER_CRM_BATCH_SIZE", 10) as usize).max(1),
            crm_batch_pause_ms: number("REVLEDGER_CRM_BATCH_PAUSE_MS", 1000),
            crm_rate_per_sec: number("REVLEDGER_CRM_RATE_PER_SEC", 0) as u32,
            scheduler_enabled: lookup("REVLEDGER_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: lookup("REVLEDGER_SYNC_CRON").unwrap_or_else(|| "0 0 */6 * * *".to_string()),
            user_agent: lookup("REVLEDGER_USER_AGENT")
                .unwrap_or_else(|| format!("revledger/{}", env!("CARGO_PKG_VERSION"))),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                base_delay: Duration::from_millis(self.http_base_delay_ms),
                ..BackoffPolicy::default()
            },
            rate_limits: RateLimit::per_second(self.crm_rate_per_sec)
                .map(|limit| (crm::ADAPTER.to_string(), limit))
                .into_iter()
                .collect(),
            ..Default::default()
        }
    }

    pub fn crm_batch_pause(&self) -> Duration {
        Duration::from_millis(self.crm_batch_pause_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompanyRegistry {
    pub companies: Vec<CompanyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompanyConfig {
    pub id: Uuid,
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub payments: Option<PaymentsConfig>,
    #[serde(default)]
    pub crm: Option<CrmConfig>,
    #[serde(default)]
    pub sheet: Option<SheetConfig>,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentsConfig {
    pub api_key: String,
    pub company_ref: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrmConfig {
    pub api_key: String,
    pub location_id: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SheetConfig {
    pub url: String,
    pub api_key: String,
    #[serde(default)]
    pub range: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl CompanyRegistry {
    pub async fn load(path: &Path) -> Result<Self, SyncError> {
        let text = fs::read_to_string(path)
            .await
            .map_err(|err| SyncError::Config(format!("reading {}: {err}", path.display())))?;
        Self::from_yaml_str(&text, |key| std::env::var(key).ok())
    }

    /// Parses the registry and resolves every `env:NAME` credential through `lookup`.
    pub fn from_yaml_str(
        text: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, SyncError> {
        let mut registry: CompanyRegistry = serde_yaml::from_str(text)
            .map_err(|err| SyncError::Config(format!("parsing company registry: {err}")))?;

        let mut seen = std::collections::HashSet::new();
        for company in &mut registry.companies {
            if !seen.insert(company.id) {
                return Err(SyncError::Config(format!("duplicate company id {}", company.id)));
            }
            let name = company.name.clone();
            if let Some(payments) = &mut company.payments {
                resolve_secret(&name, "payments.api_key", &mut payments.api_key, &lookup)?;
            }
            if let Some(crm) = &mut company.crm {
                resolve_secret(&name, "crm.api_key", &mut crm.api_key, &lookup)?;
            }
            if let Some(sheet) = &mut company.sheet {
                resolve_secret(&name, "sheet.api_key", &mut sheet.api_key, &lookup)?;
            }
        }
        Ok(registry)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &CompanyConfig> {
        self.companies.iter().filter(|c| c.enabled)
    }
}

fn resolve_secret(
    company: &str,
    field: &str,
    value: &mut String,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<(), SyncError> {
    let Some(var) = value.strip_prefix(ENV_PREFIX) else {
        return Ok(());
    };
    let var = var.trim().to_string();
    match lookup(&var).filter(|v| !v.is_empty()) {
        Some(resolved) => {
            *value = resolved;
            Ok(())
        }
        None => Err(SyncError::Config(format!(
            "company {company}: {field} refers to unset environment variable {var}"
        ))),
    }
}

impl CompanyConfig {
    pub fn to_company(&self, now: DateTime<Utc>) -> Company {
        Company {
            id: self.id,
            name: self.name.clone(),
            payments_company_ref: self.payments.as_ref().map(|p| p.company_ref.clone()),
            crm_location_id: self.crm.as_ref().map(|c| c.location_id.clone()),
            sheet_url: self.sheet.as_ref().map(|s| s.url.clone()),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const REGISTRY: &str = r#"
companies:
  - id: 6f1f3c1e-8a4f-4a3b-9a51-0c2f6d1f7b10
    name: Acme Coaching
    payments:
      api_key: env:ACME_PAYMENTS_KEY
      company_ref: biz_acme
    crm:
      api_key: literal-crm-key
      location_id: loc_acme
    sheet:
      url: https://docs.google.com/spreadsheets/d/abc123/edit
      api_key: env:SHEETS_KEY
  - id: 0b6c2a55-1d1f-4a37-8d56-6a9f5d6c2e01
    name: Dormant
    enabled: false
"#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_references_are_resolved() {
        let registry = CompanyRegistry::from_yaml_str(
            REGISTRY,
            env(&[("ACME_PAYMENTS_KEY", "pk_live"), ("SHEETS_KEY", "g_key")]),
        )
        .unwrap();

        let acme = &registry.companies[0];
        assert_eq!(acme.payments.as_ref().unwrap().api_key, "pk_live");
        assert_eq!(acme.crm.as_ref().unwrap().api_key, "literal-crm-key");
        assert_eq!(acme.sheet.as_ref().unwrap().api_key, "g_key");
        assert_eq!(registry.enabled().count(), 1);

        let company = acme.to_company(Utc::now());
        assert_eq!(company.payments_company_ref.as_deref(), Some("biz_acme"));
        assert_eq!(company.crm_location_id.as_deref(), Some("loc_acme"));
    }

    #[test]
    fn missing_env_reference_names_company_and_variable() {
        let err = CompanyRegistry::from_yaml_str(REGISTRY, env(&[("SHEETS_KEY", "g_key")])).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Acme Coaching"));
        assert!(message.contains("ACME_PAYMENTS_KEY"));
    }

    #[test]
    fn env_defaults_apply() {
        let config = SyncConfig::from_lookup(|_| None);
        assert_eq!(config.companies_file, PathBuf::from("companies.yaml"));
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.http_max_retries, 3);
        assert_eq!(config.crm_batch_size, 10);
        assert_eq!(config.sync_cron, "0 0 */6 * * *");
        assert!(!config.scheduler_enabled);
        assert!(config.database_url.is_none());
        assert!(config.http_client_config().rate_limits.is_empty());

        let tuned = SyncConfig::from_lookup(env(&[
            ("REVLEDGER_CRM_BATCH_SIZE", "0"),
            ("REVLEDGER_SCHEDULER_ENABLED", "true"),
            ("REVLEDGER_HTTP_BASE_DELAY_MS", "250"),
            ("REVLEDGER_CRM_RATE_PER_SEC", "5"),
        ]));
        assert_eq!(tuned.crm_batch_size, 1);
        assert!(tuned.scheduler_enabled);
        assert_eq!(
            tuned.http_client_config().backoff.base_delay,
            Duration::from_millis(250)
        );
        assert_eq!(
            tuned.http_client_config().rate_limits.get("crm"),
            Some(&RateLimit {
                burst: 5,
                interval: Duration::from_millis(200),
            })
        );
    }

    #[tokio::test]
    async fn registry_loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "companies:\n  - id: 6f1f3c1e-8a4f-4a3b-9a51-0c2f6d1f7b10\n    name: Plain\n"
        )
        .unwrap();

        let registry = CompanyRegistry::load(file.path()).await.unwrap();
        assert_eq!(registry.companies.len(), 1);
        assert!(registry.companies[0].payments.is_none());
    }
}
