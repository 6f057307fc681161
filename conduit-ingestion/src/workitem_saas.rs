//! Fixed-schema work-item SaaS source (spec.md §4.2 "SaaS work-item
//! source"): seven logical tables, four of them synthesized per work item
//! from sub-APIs named in the item's own `_links`. Grounded on
//! `original_source/.../sources/devops_source.py`.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use conduit_types::{Batch, Column, ColumnType, ForeignKey, Index, Record, TableSchema, Value};
use reqwest::Client;
use serde_json::Value as Json;
use tracing::{debug, info, instrument, warn};

use crate::error::SourceError;
use crate::relational::{optional_str, require_str};
use crate::source::{BatchStream, SourceAdapter, SourceConfig};

pub const TABLE_PROJECTS: &str = "projects";
pub const TABLE_TEAMS: &str = "teams";
pub const TABLE_MAIN: &str = "workitems_main";
pub const TABLE_UPDATES: &str = "workitems_updates";
pub const TABLE_COMMENTS: &str = "workitems_comments";
pub const TABLE_RELATIONS: &str = "workitems_relations";
pub const TABLE_REVISIONS: &str = "workitems_revisions";

const PROJECTS_TEAMS_API_VERSION: &str = "7.1-preview.3";
const WORK_ITEM_ID_BATCH: usize = 200;
/// Below this, a derived table's record count is diagnostic color worth a
/// warning, not a failure (DESIGN.md "supplemented features").
const LOW_RECORD_COUNT_WARNING_THRESHOLD: usize = 100;

/// Vendor namespaces stripped from a work item's `fields.*` keys so the
/// curated/forward-filled records read cleanly (spec.md §4.3 "vendor
/// prefixes stripped").
const VENDOR_PREFIXES: &[&str] = &["Microsoft.VSTS.Common.", "Microsoft.VSTS.Scheduling.", "System.", "Custom."];

fn strip_vendor_prefix(field: &str) -> &str {
    for prefix in VENDOR_PREFIXES {
        if let Some(stripped) = field.strip_prefix(prefix) {
            return stripped;
        }
    }
    field
}

fn to_value(json: &Json) -> Value {
    match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => n
            .as_i64()
            .map(Value::Int)
            .or_else(|| n.as_f64().map(Value::Float))
            .unwrap_or(Value::Null),
        Json::String(s) => Value::String(s.clone()),
        other => Value::Json(other.clone()),
    }
}

fn user_display_name(user: &Json) -> Value {
    user.get("displayName").map(to_value).unwrap_or(Value::Null)
}

fn user_unique_name(user: &Json) -> Value {
    user.get("uniqueName").map(to_value).unwrap_or(Value::Null)
}

/// `relational_db`-analogous work-item source; config keys per spec.md
/// §6's table: `access_token, organization`, optional `api_version`.
pub struct WorkItemSaasSource {
    http: Client,
    access_token: Option<String>,
    organization: String,
    api_version: String,
}

impl Default for WorkItemSaasSource {
    fn default() -> Self {
        Self {
            http: Client::new(),
            access_token: None,
            organization: String::new(),
            api_version: "7.1".to_string(),
        }
    }
}

impl WorkItemSaasSource {
    fn base_url(&self) -> String {
        format!("https://dev.azure.com/{}", self.organization)
    }

    fn auth_header(&self, token: &str) -> String {
        let credentials = base64::engine::general_purpose::STANDARD.encode(format!(":{token}"));
        format!("Basic {credentials}")
    }

    async fn get_json(&self, url: &str) -> Result<Json, SourceError> {
        let token = self
            .access_token
            .as_deref()
            .ok_or_else(|| SourceError::Connection("not connected".into()))?;
        let resp = self
            .http
            .get(url)
            .header("Authorization", self.auth_header(token))
            .header("Content-Type", "application/json")
            .send()
            .await
            .map_err(|e| SourceError::Transient {
                table: url.to_string(),
                message: e.to_string(),
            })?;
        if !resp.status().is_success() {
            return Err(SourceError::Transient {
                table: url.to_string(),
                message: format!("request returned {}", resp.status()),
            });
        }
        resp.json().await.map_err(|e| SourceError::Transient {
            table: url.to_string(),
            message: e.to_string(),
        })
    }

    async fn post_json(&self, url: &str, body: &Json) -> Result<Json, SourceError> {
        let token = self
            .access_token
            .as_deref()
            .ok_or_else(|| SourceError::Connection("not connected".into()))?;
        let resp = self
            .http
            .post(url)
            .header("Authorization", self.auth_header(token))
            .json(body)
            .send()
            .await
            .map_err(|e| SourceError::Transient {
                table: url.to_string(),
                message: e.to_string(),
            })?;
        if !resp.status().is_success() {
            return Err(SourceError::Transient {
                table: url.to_string(),
                message: format!("request returned {}", resp.status()),
            });
        }
        resp.json().await.map_err(|e| SourceError::Transient {
            table: url.to_string(),
            message: e.to_string(),
        })
    }

    /// Every project whose state is `wellformed`, with full field data for
    /// the `projects` table.
    async fn fetch_all_projects(&self) -> Result<Vec<Json>, SourceError> {
        info!("discovering all projects in organization");
        let mut all = Vec::new();
        let mut skip = 0u32;
        const TOP: u32 = 100;
        loop {
            let url = format!(
                "{}/_apis/projects?api-version={PROJECTS_TEAMS_API_VERSION}&$skip={skip}&$top={TOP}",
                self.base_url()
            );
            let result = self.get_json(&url).await?;
            let projects = result.get("value").and_then(Json::as_array).cloned().unwrap_or_default();
            if projects.is_empty() {
                break;
            }
            let count = projects.len();
            all.extend(projects);
            if count < TOP as usize {
                break;
            }
            skip += TOP;
        }
        info!(projects = all.len(), "discovered projects");
        Ok(all)
    }

    async fn fetch_all_teams(&self) -> Result<Vec<Json>, SourceError> {
        info!("fetching all teams");
        let mut all = Vec::new();
        let mut skip = 0u32;
        const TOP: u32 = 100;
        loop {
            let url = format!(
                "{}/_apis/teams?api-version={PROJECTS_TEAMS_API_VERSION}&$skip={skip}&$top={TOP}",
                self.base_url()
            );
            let result = self.get_json(&url).await?;
            let teams = result.get("value").and_then(Json::as_array).cloned().unwrap_or_default();
            if teams.is_empty() {
                break;
            }
            let count = teams.len();
            all.extend(teams);
            if count < TOP as usize {
                break;
            }
            skip += TOP;
        }
        Ok(all)
    }

    async fn work_item_ids(&self, project_name: &str) -> Result<Vec<String>, SourceError> {
        let url = format!(
            "{}/{}/_apis/wit/wiql?api-version={}",
            self.base_url(),
            percent_encoding::utf8_percent_encode(project_name, percent_encoding::NON_ALPHANUMERIC),
            self.api_version
        );
        let query = serde_json::json!({
            "query": format!(
                "SELECT [System.Id] FROM WorkItems WHERE [System.TeamProject] = '{project_name}' ORDER BY [System.Id]"
            )
        });
        let result = self.post_json(&url, &query).await?;
        Ok(result
            .get("workItems")
            .and_then(Json::as_array)
            .into_iter()
            .flatten()
            .filter_map(|r| r.get("id"))
            .filter_map(Json::as_i64)
            .map(|id| id.to_string())
            .collect())
    }

    /// Fetches a batch of work items fully expanded (`$expand=all`), which
    /// brings `fields`, `relations`, and `_links` along on every item.
    async fn fetch_work_items_batch(
        &self,
        project_name: &str,
        ids: &[String],
    ) -> Result<Vec<Json>, SourceError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!(
            "{}/{}/_apis/wit/workitems?ids={}&$expand=all&api-version={}",
            self.base_url(),
            percent_encoding::utf8_percent_encode(project_name, percent_encoding::NON_ALPHANUMERIC),
            ids.join(","),
            self.api_version
        );
        let result = self.get_json(&url).await?;
        Ok(result.get("value").and_then(Json::as_array).cloned().unwrap_or_default())
    }

    async fn fetch_work_item_updates(&self, work_item: &Json) -> Vec<Json> {
        let Some(url) = work_item
            .pointer("/_links/workItemUpdates/href")
            .and_then(Json::as_str)
        else {
            return Vec::new();
        };
        match self.get_json(url).await {
            Ok(result) => result.get("value").and_then(Json::as_array).cloned().unwrap_or_default(),
            Err(err) => {
                warn!(%err, "failed to fetch work item updates");
                Vec::new()
            }
        }
    }

    async fn fetch_work_item_comments(&self, work_item: &Json) -> Vec<Json> {
        let Some(url) = work_item
            .pointer("/_links/workItemComments/href")
            .and_then(Json::as_str)
        else {
            return Vec::new();
        };
        match self.get_json(url).await {
            Ok(result) => result
                .get("comments")
                .or_else(|| result.get("value"))
                .and_then(Json::as_array)
                .cloned()
                .unwrap_or_default(),
            Err(err) => {
                warn!(%err, "failed to fetch work item comments");
                Vec::new()
            }
        }
    }

    async fn fetch_work_item_revisions(&self, project_name: &str, work_item: &Json) -> Vec<Json> {
        let id = work_item.get("id").and_then(Json::as_i64).unwrap_or(0);
        let url = format!(
            "{}/{}/_apis/wit/workitems/{id}/revisions?api-version={}",
            self.base_url(),
            percent_encoding::utf8_percent_encode(project_name, percent_encoding::NON_ALPHANUMERIC),
            self.api_version
        );
        match self.get_json(&url).await {
            Ok(result) => result.get("value").and_then(Json::as_array).cloned().unwrap_or_default(),
            Err(err) => {
                warn!(%err, work_item_id = id, "failed to fetch work item revisions");
                Vec::new()
            }
        }
    }

    /// Curated subset of `fields.*` per spec.md's "flat `workitems_main`
    /// with curated columns"; un-requested fields are dropped at this
    /// layer, not carried through as schema drift, matching the original's
    /// "only columns that exist in the MAIN table" intent.
    fn extract_core_fields(work_item: &Json) -> Record {
        let fields = work_item.get("fields").cloned().unwrap_or(Json::Null);
        let mut record = Record::new();
        record.insert(
            "id".to_string(),
            Value::String(work_item.get("id").map(|v| v.to_string()).unwrap_or_default()),
        );
        for key in [
            "System.AreaPath",
            "System.TeamProject",
            "System.IterationPath",
            "System.WorkItemType",
            "System.State",
            "System.Reason",
            "System.CreatedDate",
            "System.ChangedDate",
            "System.Title",
            "Microsoft.VSTS.Common.Priority",
            "Microsoft.VSTS.Common.ValueArea",
            "Microsoft.VSTS.Scheduling.Effort",
        ] {
            let value = fields.get(key).map(to_value).unwrap_or(Value::Null);
            record.insert(strip_vendor_prefix(key).to_string(), value);
        }
        record.insert(
            "AssignedTo".to_string(),
            fields.get("System.AssignedTo").map(user_display_name).unwrap_or(Value::Null),
        );
        record.insert(
            "CreatedBy_uniqueName".to_string(),
            fields.get("System.CreatedBy").map(user_unique_name).unwrap_or(Value::Null),
        );
        record.insert(
            "ChangedBy_uniqueName".to_string(),
            fields.get("System.ChangedBy").map(user_unique_name).unwrap_or(Value::Null),
        );
        record.insert(
            "CommentCount".to_string(),
            fields.get("System.CommentCount").map(to_value).unwrap_or(Value::Int(0)),
        );
        record.insert(
            "description".to_string(),
            fields
                .get("System.Description")
                .and_then(Json::as_str)
                .map(|s| Value::String(s.chars().take(1000).collect()))
                .unwrap_or(Value::Null),
        );
        record
    }

    /// State-forward-fill (spec.md §4.2, DESIGN.md): each update record is
    /// a full point-in-time snapshot, filling in any field the update's own
    /// payload doesn't mention with the last value observed for that field
    /// across the revision chain.
    fn extract_updates_data(work_item: &Json, updates: &[Json]) -> Batch {
        let work_item_id = work_item.get("id").map(|v| v.to_string()).unwrap_or_default();
        let mut current_state: HashMap<String, Value> = HashMap::new();

        if updates.is_empty() {
            let mut record = Record::new();
            record.insert("work_item_id".to_string(), Value::String(work_item_id));
            record.insert("rev".to_string(), Value::Null);
            return vec![record];
        }

        let mut out = Vec::with_capacity(updates.len());
        for update in updates {
            let rev = update.get("rev").and_then(Json::as_i64).unwrap_or(0);
            let fields = update.get("fields").cloned().unwrap_or(Json::Null);

            let mut record = Record::new();
            record.insert("work_item_id".to_string(), Value::String(work_item_id.clone()));
            record.insert("rev".to_string(), Value::Int(rev));

            if let Json::Object(map) = &fields {
                for (key, field_change) in map {
                    if let Some(new_value) = field_change.get("newValue") {
                        current_state.insert(strip_vendor_prefix(key).to_string(), to_value(new_value));
                    }
                }
            }
            for role in ["revisedBy", "changedBy", "createdBy", "authorizedAs"] {
                if let Some(user) = update.get(role) {
                    if let Some(name) = user.get("displayName").and_then(Json::as_str) {
                        current_state.insert(format!("{role}_displayName"), Value::String(name.to_string()));
                    }
                    if let Some(name) = user.get("uniqueName").and_then(Json::as_str) {
                        current_state.insert(format!("{role}_uniqueName"), Value::String(name.to_string()));
                    }
                }
            }
            if let Some(revised_date) = update.get("revisedDate").and_then(Json::as_str) {
                current_state.insert("revisedDate".to_string(), Value::String(revised_date.to_string()));
            }

            for (key, value) in &current_state {
                record.insert(key.clone(), value.clone());
            }
            out.push(record);
        }
        out
    }

    fn extract_comments_data(work_item: &Json, comments: &[Json]) -> Batch {
        let work_item_id = work_item.get("id").map(|v| v.to_string()).unwrap_or_default();
        if comments.is_empty() {
            let mut record = Record::new();
            record.insert("work_item_id".to_string(), Value::String(work_item_id));
            record.insert("comment_id".to_string(), Value::Null);
            return vec![record];
        }
        comments
            .iter()
            .map(|comment| {
                let mut record = Record::new();
                record.insert("work_item_id".to_string(), Value::String(work_item_id.clone()));
                record.insert("comment_id".to_string(), comment.get("id").map(to_value).unwrap_or(Value::Null));
                record.insert(
                    "text".to_string(),
                    comment
                        .get("text")
                        .and_then(Json::as_str)
                        .map(|s| Value::String(s.chars().take(2000).collect()))
                        .unwrap_or(Value::Null),
                );
                record.insert(
                    "created_date".to_string(),
                    comment.get("createdDate").map(to_value).unwrap_or(Value::Null),
                );
                record.insert(
                    "created_by".to_string(),
                    comment.get("createdBy").map(user_display_name).unwrap_or(Value::Null),
                );
                record.insert(
                    "modified_date".to_string(),
                    comment.get("modifiedDate").map(to_value).unwrap_or(Value::Null),
                );
                record.insert(
                    "modified_by".to_string(),
                    comment.get("modifiedBy").map(user_display_name).unwrap_or(Value::Null),
                );
                record.insert(
                    "is_deleted".to_string(),
                    Value::Int(comment.get("isDeleted").and_then(Json::as_bool).unwrap_or(false) as i64),
                );
                record
            })
            .collect()
    }

    fn extract_relations_data(work_item: &Json) -> Batch {
        let work_item_id = work_item.get("id").map(|v| v.to_string()).unwrap_or_default();
        let relations = work_item.get("relations").and_then(Json::as_array);
        let Some(relations) = relations.filter(|r| !r.is_empty()) else {
            let mut record = Record::new();
            record.insert("work_item_id".to_string(), Value::String(work_item_id));
            record.insert("relation_type".to_string(), Value::Null);
            return vec![record];
        };
        relations
            .iter()
            .map(|relation| {
                let url = relation.get("url").and_then(Json::as_str).unwrap_or("");
                let mut record = Record::new();
                record.insert("work_item_id".to_string(), Value::String(work_item_id.clone()));
                record.insert(
                    "relation_type".to_string(),
                    relation.get("rel").map(to_value).unwrap_or(Value::Null),
                );
                record.insert(
                    "related_work_item_id".to_string(),
                    Value::String(url.rsplit('/').next().unwrap_or("").to_string()),
                );
                record.insert("related_work_item_url".to_string(), Value::String(url.to_string()));
                record.insert(
                    "attributes_name".to_string(),
                    relation.pointer("/attributes/name").map(to_value).unwrap_or(Value::Null),
                );
                record
            })
            .collect()
    }

    fn extract_revisions_data(work_item: &Json, revisions: &[Json]) -> Batch {
        let work_item_id = work_item.get("id").map(|v| v.to_string()).unwrap_or_default();
        if revisions.is_empty() {
            let mut record = Record::new();
            record.insert("work_item_id".to_string(), Value::String(work_item_id));
            record.insert("rev".to_string(), Value::Null);
            return vec![record];
        }
        revisions
            .iter()
            .map(|revision| {
                let fields = revision.get("fields").cloned().unwrap_or(Json::Null);
                let mut record = Record::new();
                record.insert("work_item_id".to_string(), Value::String(work_item_id.clone()));
                record.insert(
                    "rev".to_string(),
                    Value::Int(revision.get("rev").and_then(Json::as_i64).unwrap_or(0)),
                );
                for key in [
                    "System.WorkItemType",
                    "System.State",
                    "System.Reason",
                    "System.CreatedDate",
                    "System.ChangedDate",
                    "System.TeamProject",
                    "System.AreaPath",
                    "System.IterationPath",
                    "Microsoft.VSTS.Common.Priority",
                    "Microsoft.VSTS.Common.ValueArea",
                    "Microsoft.VSTS.Scheduling.Effort",
                    "System.Title",
                ] {
                    let value = fields.get(key).map(to_value).unwrap_or(Value::Null);
                    record.insert(strip_vendor_prefix(key).to_string(), value);
                }
                record.insert(
                    "CreatedBy_displayName".to_string(),
                    fields.get("System.CreatedBy").map(user_display_name).unwrap_or(Value::Null),
                );
                record.insert(
                    "CreatedBy_uniqueName".to_string(),
                    fields.get("System.CreatedBy").map(user_unique_name).unwrap_or(Value::Null),
                );
                record.insert(
                    "ChangedBy_displayName".to_string(),
                    fields.get("System.ChangedBy").map(user_display_name).unwrap_or(Value::Null),
                );
                record.insert(
                    "ChangedBy_uniqueName".to_string(),
                    fields.get("System.ChangedBy").map(user_unique_name).unwrap_or(Value::Null),
                );
                record
            })
            .collect()
    }

    /// Walks every project's work items in ID-batches of at most
    /// `WORK_ITEM_ID_BATCH`, applying `extract` to each fetched item and
    /// flattening the per-item records into one `Batch` per ID-batch.
    async fn walk_work_items<F>(&self, extract: F) -> Result<Vec<Batch>, SourceError>
    where
        F: Fn(&Json) -> Batch,
    {
        let mut out = Vec::new();
        for project in self.fetch_all_projects().await? {
            let Some(project_name) = project.get("name").and_then(Json::as_str) else {
                continue;
            };
            let ids = self.work_item_ids(project_name).await.unwrap_or_default();
            if ids.is_empty() {
                continue;
            }
            for chunk in ids.chunks(WORK_ITEM_ID_BATCH) {
                let work_items = self.fetch_work_items_batch(project_name, chunk).await?;
                let mut batch = Vec::new();
                for work_item in &work_items {
                    batch.extend(extract(work_item));
                }
                if !batch.is_empty() {
                    out.push(batch);
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl SourceAdapter for WorkItemSaasSource {
    fn kind(&self) -> &'static str {
        "workitem_saas"
    }

    #[instrument(skip(self, config))]
    async fn connect(&mut self, config: &SourceConfig) -> Result<(), SourceError> {
        let access_token = require_str(config, "access_token")?.to_string();
        let organization = require_str(config, "organization")?.to_string();
        let api_version = optional_str(config, "api_version").unwrap_or("7.1").to_string();

        self.access_token = Some(access_token);
        self.organization = organization;
        self.api_version = api_version;

        let url = format!("{}/_apis/projects?api-version={}", self.base_url(), self.api_version);
        self.get_json(&url).await.map_err(|e| SourceError::Connection(e.to_string()))?;
        info!(organization = self.organization, "connected to work-item source");
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.access_token = None;
    }

    async fn list_tables(&mut self) -> Result<Vec<String>, SourceError> {
        Ok(vec![
            TABLE_PROJECTS.to_string(),
            TABLE_TEAMS.to_string(),
            TABLE_MAIN.to_string(),
            TABLE_UPDATES.to_string(),
            TABLE_COMMENTS.to_string(),
            TABLE_RELATIONS.to_string(),
            TABLE_REVISIONS.to_string(),
        ])
    }

    #[instrument(skip(self))]
    async fn get_schema(&mut self, table: &str) -> Result<TableSchema, SourceError> {
        let columns = match table {
            TABLE_PROJECTS => vec![
                Column::new("id", ColumnType::String, false),
                Column::new("name", ColumnType::String, true),
                Column::new("description", ColumnType::String, true),
                Column::new("state", ColumnType::String, true),
                Column::new("revision", ColumnType::Int64, true),
                Column::new("lastUpdateTime", ColumnType::String, true),
            ],
            TABLE_TEAMS => vec![
                Column::new("id", ColumnType::String, false),
                Column::new("name", ColumnType::String, true),
                Column::new("description", ColumnType::String, true),
                Column::new("projectName", ColumnType::String, true),
                Column::new("projectId", ColumnType::String, true),
            ],
            TABLE_MAIN => vec![Column::new("id", ColumnType::String, false)],
            TABLE_UPDATES | TABLE_REVISIONS => vec![
                Column::new("work_item_id", ColumnType::String, false),
                Column::new("rev", ColumnType::Int64, false),
            ],
            TABLE_COMMENTS => vec![
                Column::new("work_item_id", ColumnType::String, false),
                Column::new("comment_id", ColumnType::String, true),
            ],
            TABLE_RELATIONS => vec![
                Column::new("work_item_id", ColumnType::String, false),
                Column::new("relation_type", ColumnType::String, true),
            ],
            other => {
                return Err(SourceError::Schema {
                    table: other.to_string(),
                    message: "unknown work-item logical table".to_string(),
                })
            }
        };
        // Dynamic tables declare only their key columns up front; the sink's
        // evolve-on-write absorbs the rest, per spec.md's schema fallback.
        debug!(table, columns = columns.len(), "fetched schema");
        Ok(TableSchema::new(columns))
    }

    fn read_data(&self, table: &str, batch_size: usize) -> BatchStream {
        let batch_size = batch_size.max(1);
        let table = table.to_string();
        let http = self.http.clone();
        let access_token = self.access_token.clone();
        let organization = self.organization.clone();
        let api_version = self.api_version.clone();

        Box::pin(async_stream::try_stream! {
            let source = WorkItemSaasSource { http, access_token, organization, api_version };
            let raw_batches: Vec<Batch> = match table.as_str() {
                TABLE_PROJECTS => {
                    let projects = source.fetch_all_projects().await?;
                    let batch: Batch = projects.iter().map(|p| {
                        let mut record = Record::new();
                        record.insert("id".into(), p.get("id").map(to_value).unwrap_or(Value::Null));
                        record.insert("name".into(), p.get("name").map(to_value).unwrap_or(Value::Null));
                        record.insert("description".into(), p.get("description").map(to_value).unwrap_or(Value::Null));
                        record.insert("state".into(), p.get("state").map(to_value).unwrap_or(Value::Null));
                        record.insert("revision".into(), p.get("revision").map(to_value).unwrap_or(Value::Int(0)));
                        record.insert("lastUpdateTime".into(), p.get("lastUpdateTime").map(to_value).unwrap_or(Value::Null));
                        record
                    }).collect();
                    vec![batch]
                }
                TABLE_TEAMS => {
                    let teams = source.fetch_all_teams().await?;
                    let batch: Batch = teams.iter().map(|t| {
                        let mut record = Record::new();
                        record.insert("id".into(), t.get("id").map(to_value).unwrap_or(Value::Null));
                        record.insert("name".into(), t.get("name").map(to_value).unwrap_or(Value::Null));
                        record.insert("description".into(), t.get("description").map(to_value).unwrap_or(Value::Null));
                        record.insert("projectName".into(), t.get("projectName").map(to_value).unwrap_or(Value::Null));
                        record.insert("projectId".into(), t.get("projectId").map(to_value).unwrap_or(Value::Null));
                        record
                    }).collect();
                    vec![batch]
                }
                TABLE_MAIN => source.walk_work_items(|wi| vec![WorkItemSaasSource::extract_core_fields(wi)]).await?,
                TABLE_UPDATES => {
                    let mut out = Vec::new();
                    for project in source.fetch_all_projects().await? {
                        let Some(project_name) = project.get("name").and_then(Json::as_str) else { continue };
                        let ids = source.work_item_ids(project_name).await.unwrap_or_default();
                        for chunk in ids.chunks(WORK_ITEM_ID_BATCH) {
                            let work_items = source.fetch_work_items_batch(project_name, chunk).await?;
                            let mut batch = Vec::new();
                            for work_item in &work_items {
                                let updates = source.fetch_work_item_updates(work_item).await;
                                batch.extend(WorkItemSaasSource::extract_updates_data(work_item, &updates));
                            }
                            if !batch.is_empty() {
                                out.push(batch);
                            }
                        }
                    }
                    out
                }
                TABLE_COMMENTS => {
                    let mut out = Vec::new();
                    for project in source.fetch_all_projects().await? {
                        let Some(project_name) = project.get("name").and_then(Json::as_str) else { continue };
                        let ids = source.work_item_ids(project_name).await.unwrap_or_default();
                        for chunk in ids.chunks(WORK_ITEM_ID_BATCH) {
                            let work_items = source.fetch_work_items_batch(project_name, chunk).await?;
                            let mut batch = Vec::new();
                            for work_item in &work_items {
                                let comments = source.fetch_work_item_comments(work_item).await;
                                batch.extend(WorkItemSaasSource::extract_comments_data(work_item, &comments));
                            }
                            if !batch.is_empty() {
                                out.push(batch);
                            }
                        }
                    }
                    out
                }
                TABLE_RELATIONS => source.walk_work_items(WorkItemSaasSource::extract_relations_data).await?,
                TABLE_REVISIONS => {
                    let mut out = Vec::new();
                    for project in source.fetch_all_projects().await? {
                        let Some(project_name) = project.get("name").and_then(Json::as_str) else { continue };
                        let ids = source.work_item_ids(project_name).await.unwrap_or_default();
                        for chunk in ids.chunks(WORK_ITEM_ID_BATCH) {
                            let work_items = source.fetch_work_items_batch(project_name, chunk).await?;
                            let mut batch = Vec::new();
                            for work_item in &work_items {
                                let revisions = source.fetch_work_item_revisions(project_name, work_item).await;
                                batch.extend(WorkItemSaasSource::extract_revisions_data(work_item, &revisions));
                            }
                            if !batch.is_empty() {
                                out.push(batch);
                            }
                        }
                    }
                    out
                }
                other => {
                    Err(SourceError::Permanent { table: other.to_string(), message: "unknown work-item logical table".to_string() })?;
                    Vec::new()
                }
            };

            let total: usize = raw_batches.iter().map(|b| b.len()).sum();
            if matches!(table.as_str(), TABLE_UPDATES | TABLE_COMMENTS) && total > 0 && total < LOW_RECORD_COUNT_WARNING_THRESHOLD {
                warn!(table, records = total, "unexpectedly low record count for work-item derived table");
            }

            for records in raw_batches {
                for chunk in records.chunks(batch_size) {
                    yield chunk.to_vec();
                }
            }
        })
    }

    fn read_incremental(
        &self,
        table: &str,
        _watermark: DateTime<Utc>,
        batch_size: usize,
    ) -> BatchStream {
        warn!(table, "work-item source has no native incremental filter, reading all data");
        self.read_data(table, batch_size)
    }

    fn incremental_is_exact(&self) -> bool {
        false
    }

    async fn get_primary_key_columns(&mut self, table: &str) -> Result<Vec<String>, SourceError> {
        Ok(match table {
            TABLE_PROJECTS | TABLE_TEAMS | TABLE_MAIN => vec!["id".to_string()],
            TABLE_UPDATES | TABLE_REVISIONS => vec!["work_item_id".to_string(), "rev".to_string()],
            _ => Vec::new(),
        })
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
    fn strips_known_vendor_prefixes() {
        assert_eq!(strip_vendor_prefix("System.State"), "State");
        assert_eq!(strip_vendor_prefix("Microsoft.VSTS.Common.Priority"), "Priority");
        assert_eq!(strip_vendor_prefix("Custom.Product"), "Product");
        assert_eq!(strip_vendor_prefix("already_clean"), "already_clean");
    }

    #[test]
    fn forward_fill_carries_state_across_updates() {
        let work_item = serde_json::json!({"id": 42});
        let updates = vec![
            serde_json::json!({
                "rev": 1,
                "fields": {"System.State": {"newValue": "New"}},
            }),
            serde_json::json!({
                "rev": 2,
                "fields": {"System.Title": {"newValue": "Hello"}},
            }),
        ];
        let records = WorkItemSaasSource::extract_updates_data(&work_item, &updates);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].get("State"), Some(&Value::String("New".to_string())));
        assert_eq!(records[1].get("Title"), Some(&Value::String("Hello".to_string())));
    }

    #[test]
    fn empty_updates_yields_one_sentinel_row() {
        let work_item = serde_json::json!({"id": 7});
        let records = WorkItemSaasSource::extract_updates_data(&work_item, &[]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("rev"), Some(&Value::Null));
    }

    #[test]
    fn empty_relations_yields_one_sentinel_row() {
        let work_item = serde_json::json!({"id": 7, "relations": []});
        let records = WorkItemSaasSource::extract_relations_data(&work_item);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("relation_type"), Some(&Value::Null));
    }
}
