//! Sync pipeline: search, dedup against the ledger, extract beacon fields, push custom-field updates.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use beacon_core::{
    BeaconExtraction, Conversation, ConversationId, ConversationSummary, CustomFieldsUpdate,
    FieldMapping, LedgerEntry,
};
use beacon_extract::BeaconExtractor;
use beacon_storage::{
    HelpdeskClient, HelpdeskConfig, HttpClientConfig, LedgerStore, Method, SqlLedgerStore,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "beacon-sync";

pub const DEFAULT_API_BASE: &str = "https://api.helpscout.net/v1/";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub helpdesk: HelpdeskConfig,
    pub search_query: String,
    pub ledger_database_url: String,
    pub field_map_path: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            helpdesk: HelpdeskConfig {
                base_url: DEFAULT_API_BASE.to_string(),
                user: String::new(),
                password: "X".to_string(),
            },
            search_query: String::new(),
            ledger_database_url: "sqlite://beacon-ledger.db?mode=rwc".to_string(),
            field_map_path: PathBuf::from("field_map.yaml"),
            scheduler_enabled: false,
            sync_cron: "0 */15 * * * *".to_string(),
            user_agent: "beacon-sync/0.1".to_string(),
            http_timeout_secs: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            helpdesk: HelpdeskConfig {
                base_url: std::env::var("HELPDESK_API_BASE").unwrap_or(defaults.helpdesk.base_url),
                user: std::env::var("HELPDESK_API_USER").unwrap_or(defaults.helpdesk.user),
                password: std::env::var("HELPDESK_API_PASSWORD")
                    .unwrap_or(defaults.helpdesk.password),
            },
            search_query: std::env::var("HELPDESK_SEARCH_QUERY").unwrap_or(defaults.search_query),
            ledger_database_url: std::env::var("LEDGER_DATABASE_URL")
                .unwrap_or(defaults.ledger_database_url),
            field_map_path: std::env::var("BEACON_FIELD_MAP")
                .map(PathBuf::from)
                .unwrap_or(defaults.field_map_path),
            scheduler_enabled: std::env::var("BEACON_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or(defaults.sync_cron),
            user_agent: std::env::var("HELPDESK_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: parse_timeout_secs(
                std::env::var("HELPDESK_HTTP_TIMEOUT_SECS").ok().as_deref(),
            ),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout_secs.map(Duration::from_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

/// Unparseable values fall back to no timeout, with a warning.
fn parse_timeout_secs(raw: Option<&str>) -> Option<u64> {
    let raw = raw?.trim();
    match raw.parse() {
        Ok(secs) => Some(secs),
        Err(err) => {
            warn!(value = raw, error = %err, "ignoring invalid HELPDESK_HTTP_TIMEOUT_SECS");
            None
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct FieldMapFile {
    fields: FieldMapping,
}

pub fn parse_field_mapping(text: &str) -> Result<FieldMapping> {
    let file: FieldMapFile = serde_yaml::from_str(text).context("parsing field mapping")?;
    Ok(file.fields)
}

pub fn load_field_mapping(path: &Path) -> Result<FieldMapping> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading field mapping {}", path.display()))?;
    parse_field_mapping(&text).with_context(|| format!("loading {}", path.display()))
}

/// The query is appended as-is; callers encode it.
pub fn search_path(query: &str) -> String {
    format!("search/conversations.json?{query}")
}

pub fn conversation_path(id: &ConversationId) -> String {
    format!("conversations/{id}.json")
}

/// Runs a search and drops conversations the ledger already holds.
pub struct ConversationFetcher<'a> {
    client: &'a HelpdeskClient,
    ledger: &'a dyn LedgerStore,
}

impl<'a> ConversationFetcher<'a> {
    pub fn new(client: &'a HelpdeskClient, ledger: &'a dyn LedgerStore) -> Self {
        Self { client, ledger }
    }

    pub async fn fetch_by_query(&self, query: &str) -> Result<Vec<ConversationSummary>> {
        let path = search_path(query);
        let found: Vec<ConversationSummary> = self
            .client
            .request(Method::GET, &path, None)
            .await?
            .into_items(&path)?;
        let processed = self.ledger.all_ids().await?;
        Ok(found
            .into_iter()
            .filter(|c| !processed.contains(&c.id))
            .collect())
    }
}

pub struct ConversationLoader<'a> {
    client: &'a HelpdeskClient,
}

impl<'a> ConversationLoader<'a> {
    pub fn new(client: &'a HelpdeskClient) -> Self {
        Self { client }
    }

    pub async fn load(&self, summary: &ConversationSummary) -> Result<Conversation> {
        self.load_by_id(&summary.id).await
    }

    pub async fn load_by_id(&self, id: &ConversationId) -> Result<Conversation> {
        let path = conversation_path(id);
        let conversation: Conversation = self
            .client
            .request(Method::GET, &path, None)
            .await
            .and_then(|payload| payload.into_item(&path))
            .with_context(|| format!("loading conversation {id}"))?;
        Ok(conversation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Sent,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub conversation_id: ConversationId,
    pub payload: String,
    pub outcome: DispatchOutcome,
}

/// Pushes mapped custom fields and records every attempt in the ledger.
///
/// The ledger write happens whether or not the PUT succeeded; a crash between
/// the two means the same full-overwrite update is sent again next run.
pub struct UpdateDispatcher<'a> {
    client: &'a HelpdeskClient,
    ledger: &'a dyn LedgerStore,
    mapping: &'a FieldMapping,
}

impl<'a> UpdateDispatcher<'a> {
    pub fn new(
        client: &'a HelpdeskClient,
        ledger: &'a dyn LedgerStore,
        mapping: &'a FieldMapping,
    ) -> Self {
        Self {
            client,
            ledger,
            mapping,
        }
    }

    pub fn build_payload(&self, extraction: &BeaconExtraction) -> Result<String> {
        let update = CustomFieldsUpdate::from_fields(&extraction.fields, self.mapping);
        serde_json::to_string(&update).context("serializing custom field update")
    }

    /// `None` entries are skipped without touching the ledger.
    pub async fn dispatch(
        &self,
        results: Vec<Option<BeaconExtraction>>,
    ) -> Result<Vec<DispatchReport>> {
        let mut reports = Vec::new();
        for extraction in results.into_iter().flatten() {
            reports.push(self.dispatch_one(&extraction).await?);
        }
        Ok(reports)
    }

    pub async fn dispatch_one(&self, extraction: &BeaconExtraction) -> Result<DispatchReport> {
        let id = &extraction.conversation_id;
        let payload = self.build_payload(extraction)?;

        let outcome = match self
            .client
            .send(Method::PUT, &conversation_path(id), Some(&payload))
            .await
        {
            Ok(()) => DispatchOutcome::Sent,
            Err(err) => DispatchOutcome::Failed {
                reason: err.to_string(),
            },
        };

        self.ledger
            .upsert(&LedgerEntry {
                conversation_id: id.clone(),
                payload_sent: payload.clone(),
                updated_on: Utc::now(),
            })
            .await?;
        match &outcome {
            DispatchOutcome::Sent => {
                info!(conversation_id = %id, payload = %payload, "conversation custom fields updated")
            }
            DispatchOutcome::Failed { reason } => {
                warn!(conversation_id = %id, payload = %payload, %reason, "conversation custom field update failed")
            }
        }

        Ok(DispatchReport {
            conversation_id: id.clone(),
            payload,
            outcome,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub query: String,
    pub matched: usize,
    pub skipped: usize,
    /// Conversations that could not be loaded; left out of the ledger so a later run retries them.
    pub unavailable: usize,
    pub sent: usize,
    pub failed: usize,
    pub reports: Vec<DispatchReport>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    client: HelpdeskClient,
    ledger: Arc<dyn LedgerStore>,
    mapping: FieldMapping,
    extractor: BeaconExtractor,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        ledger: Arc<dyn LedgerStore>,
        mapping: FieldMapping,
    ) -> Result<Self> {
        let client = HelpdeskClient::new(config.helpdesk.clone(), config.http_client_config())?;
        Ok(Self {
            config,
            client,
            ledger,
            mapping,
            extractor: BeaconExtractor::new(),
            run_lock: Mutex::new(()),
        })
    }

    /// Loads the field mapping file and opens the SQL ledger named in `config`.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let mapping = load_field_mapping(&config.field_map_path)?;
        let ledger = SqlLedgerStore::connect(&config.ledger_database_url).await?;
        Self::new(config, Arc::new(ledger), mapping)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn ledger(&self) -> &dyn LedgerStore {
        self.ledger.as_ref()
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        self.run_query(&self.config.search_query).await
    }

    /// One sequential pass; concurrent callers wait for the previous pass.
    pub async fn run_query(&self, query: &str) -> Result<SyncRunSummary> {
        let _running = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, query);
        self.run_query_inner(run_id, query).instrument(span).await
    }

    async fn run_query_inner(&self, run_id: Uuid, query: &str) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let ledger = self.ledger.as_ref();

        let pending = ConversationFetcher::new(&self.client, ledger)
            .fetch_by_query(query)
            .await
            .context("fetching conversations")?;

        let loader = ConversationLoader::new(&self.client);
        let mut extractions = Vec::with_capacity(pending.len());
        let mut unavailable = 0;
        for summary in &pending {
            let conversation = match loader.load(summary).await {
                Ok(conversation) => conversation,
                Err(err) => {
                    warn!(conversation_id = %summary.id, error = %format!("{err:#}"), "skipping conversation that failed to load");
                    unavailable += 1;
                    continue;
                }
            };
            extractions.push(self.extractor.extract(&conversation)?);
        }
        let skipped = extractions.iter().filter(|e| e.is_none()).count();

        let reports = UpdateDispatcher::new(&self.client, ledger, &self.mapping)
            .dispatch(extractions)
            .await?;
        let sent = reports
            .iter()
            .filter(|r| r.outcome == DispatchOutcome::Sent)
            .count();

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            query: query.to_string(),
            matched: pending.len(),
            skipped,
            unavailable,
            sent,
            failed: reports.len() - sent,
            reports,
        })
    }

    /// Payload that a run would send for one conversation; nothing is sent or recorded.
    pub async fn preview(&self, id: &ConversationId) -> Result<Option<String>> {
        let conversation = ConversationLoader::new(&self.client).load_by_id(id).await?;
        let Some(extraction) = self.extractor.extract(&conversation)? else {
            return Ok(None);
        };
        UpdateDispatcher::new(&self.client, self.ledger.as_ref(), &self.mapping)
            .build_payload(&extraction)
            .map(Some)
    }

    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        matched = summary.matched,
                        unavailable = summary.unavailable,
                        sent = summary.sent,
                        failed = summary.failed,
                        "scheduled sync finished"
                    ),
                    Err(err) => warn!(error = %format!("{err:#}"), "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_sync_once_from_env(query: Option<String>) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::connect(config).await?;
    match query {
        Some(query) => pipeline.run_query(&query).await,
        None => pipeline.run_once().await,
    }
}
