//! SaaS CRM source (spec.md §4.2 "SaaS CRM source"): OAuth2 refresh-token
//! auth against a regional identity endpoint, module enumeration via a
//! settings endpoint, paged module reads. Grounded on
//! `original_source/.../sources/zoho_source.py`.

use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_types::{Batch, Column, ColumnType, ForeignKey, Index, Record, TableSchema, Value};
use reqwest::Client;
use serde_json::Value as Json;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::error::SourceError;
use crate::relational::{optional_str, require_str};
use crate::retry::{retry_with_backoff, SOURCE_API_ATTEMPTS, SOURCE_API_DELAYS};
use crate::source::{BatchStream, SourceAdapter, SourceConfig};

const PAGE_SIZE: usize = 200;

/// Maps a region's data-center domain to its identity (accounts) domain,
/// mirroring the original's `accounts_domain_map`.
fn accounts_domain_for(api_domain: &str) -> &'static str {
    match api_domain {
        "https://www.zohoapis.com" => "https://accounts.zoho.com",
        "https://www.zohoapis.eu" => "https://accounts.zoho.eu",
        "https://www.zohoapis.com.au" => "https://accounts.zoho.com.au",
        "https://www.zohoapis.jp" => "https://accounts.zoho.jp",
        _ => "https://accounts.zoho.in",
    }
}

#[derive(Clone)]
struct TokenState {
    access_token: String,
    api_domain: String,
}

/// `crm_saas` source kind, Zoho-CRM-like. Holds the refresh-token triple so
/// a 401 mid-stream can mint a fresh access token without re-`connect`ing.
pub struct CrmSaasSource {
    http: Client,
    refresh_token: String,
    client_id: String,
    client_secret: String,
    token: Option<Arc<RwLock<TokenState>>>,
}

impl Default for CrmSaasSource {
    fn default() -> Self {
        Self {
            http: Client::new(),
            refresh_token: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            token: None,
        }
    }
}

impl CrmSaasSource {
    async fn fetch_access_token(
        http: &Client,
        refresh_token: &str,
        client_id: &str,
        client_secret: &str,
        api_domain: &str,
    ) -> Result<TokenState, SourceError> {
        let accounts_domain = accounts_domain_for(api_domain);
        let url = format!("{accounts_domain}/oauth/v2/token");
        let params = [
            ("refresh_token", refresh_token),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("grant_type", "refresh_token"),
        ];

        let resp = http
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;
        let status = resp.status();
        let body: Json = resp
            .json()
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;
        if !status.is_success() {
            return Err(SourceError::Connection(format!(
                "token endpoint returned {status}: {body}"
            )));
        }
        let access_token = body
            .get("access_token")
            .and_then(Json::as_str)
            .ok_or_else(|| SourceError::Connection("token response missing access_token".into()))?
            .to_string();
        let resolved_domain = body
            .get("api_domain")
            .and_then(Json::as_str)
            .unwrap_or(api_domain)
            .to_string();
        info!(api_domain = %resolved_domain, "obtained CRM access token");
        Ok(TokenState {
            access_token,
            api_domain: resolved_domain,
        })
    }

    async fn refresh(&self) -> Result<TokenState, SourceError> {
        let api_domain = match &self.token {
            Some(t) => t.read().await.api_domain.clone(),
            None => "https://www.zohoapis.in".to_string(),
        };
        Self::fetch_access_token(
            &self.http,
            &self.refresh_token,
            &self.client_id,
            &self.client_secret,
            &api_domain,
        )
        .await
    }

    async fn auth_header(&self) -> Result<(String, String), SourceError> {
        let state = self
            .token
            .as_ref()
            .ok_or_else(|| SourceError::Connection("not connected".into()))?
            .read()
            .await
            .clone();
        Ok((
            format!("Zoho-oauthtoken {}", state.access_token),
            state.api_domain,
        ))
    }

    /// Every field the module exposes, pulled from settings metadata, per
    /// the original's `_get_module_field_names`. All CRM fields travel as
    /// strings (spec.md §4.2: "all fields string-typed for this source
    /// kind").
    async fn module_field_names(
        http: &Client,
        api_domain: &str,
        token: &str,
        module: &str,
    ) -> Result<Vec<String>, SourceError> {
        let url = format!("{api_domain}/crm/v2/settings/modules/{module}");
        let resp = http
            .get(&url)
            .header("Authorization", format!("Zoho-oauthtoken {token}"))
            .send()
            .await
            .map_err(|e| SourceError::Schema {
                table: module.to_string(),
                message: e.to_string(),
            })?;
        if !resp.status().is_success() {
            return Err(SourceError::Schema {
                table: module.to_string(),
                message: format!("field metadata request returned {}", resp.status()),
            });
        }
        let body: Json = resp.json().await.map_err(|e| SourceError::Schema {
            table: module.to_string(),
            message: e.to_string(),
        })?;
        let fields = body
            .get("modules")
            .and_then(Json::as_array)
            .and_then(|m| m.first())
            .and_then(|m| m.get("fields"))
            .or_else(|| body.get("fields"))
            .and_then(Json::as_array)
            .cloned()
            .unwrap_or_default();

        let mut names: Vec<String> = fields
            .iter()
            .filter_map(|f| f.get("api_name").and_then(Json::as_str))
            .map(String::from)
            .collect();
        names.push("id".to_string());
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Flattens nested/compound values to strings for this source kind, per
    /// `_normalize_value`: dict/list become a JSON string, everything else
    /// becomes its display string, `None` stays `Null`.
    fn normalize_value(value: &Json) -> Value {
        match value {
            Json::Null => Value::Null,
            Json::Object(_) | Json::Array(_) => Value::String(value.to_string()),
            Json::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        }
    }
}

#[async_trait]
impl SourceAdapter for CrmSaasSource {
    fn kind(&self) -> &'static str {
        "crm_saas"
    }

    #[instrument(skip(self, config))]
    async fn connect(&mut self, config: &SourceConfig) -> Result<(), SourceError> {
        let refresh_token = require_str(config, "refresh_token")?.to_string();
        let client_id = require_str(config, "client_id")?.to_string();
        let client_secret = require_str(config, "client_secret")?.to_string();
        let api_domain = optional_str(config, "api_domain")
            .unwrap_or("https://www.zohoapis.in")
            .to_string();

        let state =
            Self::fetch_access_token(&self.http, &refresh_token, &client_id, &client_secret, &api_domain)
                .await?;

        self.refresh_token = refresh_token;
        self.client_id = client_id;
        self.client_secret = client_secret;
        self.token = Some(Arc::new(RwLock::new(state)));
        info!("connected to CRM SaaS source");
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.token = None;
    }

    #[instrument(skip(self))]
    async fn list_tables(&mut self) -> Result<Vec<String>, SourceError> {
        let (auth, api_domain) = self.auth_header().await?;
        let url = format!("{api_domain}/crm/v8/settings/modules");
        let resp = self
            .http
            .get(&url)
            .header("Authorization", &auth)
            .send()
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(SourceError::Connection(format!(
                "module list request returned {}",
                resp.status()
            )));
        }
        let body: Json = resp
            .json()
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;
        let mut names: Vec<String> = body
            .get("modules")
            .and_then(Json::as_array)
            .into_iter()
            .flatten()
            .filter_map(|m| m.get("api_name").and_then(Json::as_str))
            .map(String::from)
            .collect();
        names.sort();
        debug!(modules = names.len(), "listed CRM modules");
        Ok(names)
    }

    #[instrument(skip(self))]
    async fn get_schema(&mut self, table: &str) -> Result<TableSchema, SourceError> {
        let (_, api_domain) = self.auth_header().await?;
        let token = self.token.as_ref().unwrap().read().await.access_token.clone();
        let field_names = match Self::module_field_names(&self.http, &api_domain, &token, table).await {
            Ok(names) => names,
            Err(err) => {
                warn!(%err, table, "field metadata unavailable, falling back to a single id column");
                vec!["id".to_string()]
            }
        };
        let columns = field_names
            .into_iter()
            .map(|name| Column::new(name, ColumnType::String, true))
            .collect();
        Ok(TableSchema::new(columns))
    }

    fn read_data(&self, table: &str, batch_size: usize) -> BatchStream {
        let http = self.http.clone();
        let token = self.token.clone();
        let refresh_token = self.refresh_token.clone();
        let client_id = self.client_id.clone();
        let client_secret = self.client_secret.clone();
        let table = table.to_string();
        let batch_size = if batch_size == 0 { PAGE_SIZE } else { batch_size };

        Box::pin(try_stream! {
            let token = token.ok_or_else(|| SourceError::Connection("not connected".into()))?;
            let mut page = 1u32;
            // A paginator must never process the same page number twice within
            // one table (spec.md §4.2); a hit here drops that page's payload
            // and just advances, mirroring `zoho_service/app.py`'s guard.
            let mut processed_pages: std::collections::HashSet<u32> = std::collections::HashSet::new();
            loop {
                if processed_pages.contains(&page) {
                    warn!(table, page, "duplicate page detected, dropping and advancing");
                    page += 1;
                    continue;
                }

                let (auth, api_domain) = {
                    let state = token.read().await;
                    (format!("Zoho-oauthtoken {}", state.access_token), state.api_domain.clone())
                };
                let url = format!("{api_domain}/crm/v2/{table}");
                let query = [("page", page.to_string()), ("per_page", batch_size.to_string())];

                // 5xx/connect/timeout errors retry with backoff; a non-401 4xx
                // is classified `Permanent` here so `should_retry` stops the
                // loop immediately instead of burning the whole budget on an
                // error that will never resolve (spec.md §4.2 failure policy).
                let page_result = retry_with_backoff(
                    SOURCE_API_ATTEMPTS,
                    &SOURCE_API_DELAYS,
                    |_attempt| {
                        let http = http.clone();
                        let url = url.clone();
                        let auth = auth.clone();
                        let query = query.clone();
                        let table = table.clone();
                        async move {
                            let response = http.get(&url)
                                .header("Authorization", auth)
                                .query(&query)
                                .send()
                                .await
                                .map_err(|e| SourceError::Transient { table: table.clone(), message: e.to_string() })?;

                            let status = response.status();
                            if status.is_server_error() {
                                return Err(SourceError::Transient {
                                    table,
                                    message: format!("module fetch failed: {status}"),
                                });
                            }
                            if status.is_client_error() && status != reqwest::StatusCode::UNAUTHORIZED {
                                return Err(SourceError::Permanent {
                                    table,
                                    message: format!("module fetch failed: {status}"),
                                });
                            }
                            Ok(response)
                        }
                    },
                    |err| matches!(err, SourceError::Transient { .. }),
                ).await?;

                if page_result.status() == reqwest::StatusCode::NO_CONTENT {
                    info!(table, "no records found");
                    return;
                }
                if page_result.status() == reqwest::StatusCode::UNAUTHORIZED {
                    warn!(table, "access token expired mid-stream, refreshing");
                    let fresh = CrmSaasSource::fetch_access_token(&http, &refresh_token, &client_id, &client_secret, &api_domain).await?;
                    *token.write().await = fresh;
                    continue;
                }

                let body: Json = page_result.json().await
                    .map_err(|e| SourceError::Transient { table: table.clone(), message: e.to_string() })?;
                let data = body.get("data").and_then(Json::as_array).cloned().unwrap_or_default();
                processed_pages.insert(page);
                if data.is_empty() {
                    return;
                }

                let batch: Batch = data
                    .iter()
                    .map(|record| {
                        let mut out = Record::new();
                        if let Json::Object(map) = record {
                            for (key, value) in map {
                                out.insert(key.clone(), CrmSaasSource::normalize_value(value));
                            }
                        }
                        out
                    })
                    .collect();
                info!(table, records = batch.len(), page, "retrieved CRM page");
                yield batch;

                let more = body
                    .get("info")
                    .and_then(|i| i.get("more_records"))
                    .and_then(Json::as_bool)
                    .unwrap_or(false);
                if !more {
                    return;
                }
                page += 1;
            }
        })
    }

    fn read_incremental(
        &self,
        table: &str,
        _watermark: DateTime<Utc>,
        batch_size: usize,
    ) -> BatchStream {
        // The original admits this plainly: "Zoho API doesn't have built-in
        // incremental sync, so we read all data." Carried as-is.
        warn!(table, "CRM SaaS source has no native incremental filter, reading all data");
        self.read_data(table, batch_size)
    }

    fn incremental_is_exact(&self) -> bool {
        false
    }

    async fn get_primary_key_columns(&mut self, _table: &str) -> Result<Vec<String>, SourceError> {
        Ok(vec!["id".to_string()])
    }

    async fn get_foreign_keys(&mut self, _table: &str) -> Result<Vec<ForeignKey>, SourceError> {
        Ok(Vec::new())
    }

    async fn get_unique_constraints(&mut self, _table: &str) -> Result<Vec<Index>, SourceError> {
        Ok(Vec::new())
    }

    async fn get_indexes(&mut self, _table: &str) -> Result<Vec<Index>, SourceError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounts_domain_maps_known_regions() {
        assert_eq!(accounts_domain_for("https://www.zohoapis.eu"), "https://accounts.zoho.eu");
        assert_eq!(accounts_domain_for("https://www.zohoapis.com"), "https://accounts.zoho.com");
        assert_eq!(accounts_domain_for("https://unknown.example"), "https://accounts.zoho.in");
    }

    #[test]
    fn normalize_value_flattens_compound_values_to_strings() {
        let nested = serde_json::json!({"a": 1, "b": [1, 2]});
        assert!(matches!(CrmSaasSource::normalize_value(&nested), Value::String(_)));
        assert!(matches!(CrmSaasSource::normalize_value(&Json::Null), Value::Null));
    }
}
