//! Durable set of conversations that have already been pushed.

use std::collections::{BTreeMap, HashSet};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use beacon_core::{ConversationId, LedgerEntry};
use chrono::DateTime;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tokio::sync::Mutex;

pub const LEDGER_TABLE: &str = "processed_conversations";

/// Upsert-by-id record of synchronized conversations.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn contains(&self, id: &ConversationId) -> Result<bool>;

    async fn all_ids(&self) -> Result<HashSet<ConversationId>>;

    async fn upsert(&self, entry: &LedgerEntry) -> Result<()>;

    /// Returns whether an entry existed.
    async fn remove(&self, id: &ConversationId) -> Result<bool>;

    /// All entries ordered by conversation id.
    async fn entries(&self) -> Result<Vec<LedgerEntry>>;
}

#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    entries: Mutex<BTreeMap<ConversationId, LedgerEntry>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn contains(&self, id: &ConversationId) -> Result<bool> {
        Ok(self.entries.lock().await.contains_key(id))
    }

    async fn all_ids(&self) -> Result<HashSet<ConversationId>> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }

    async fn upsert(&self, entry: &LedgerEntry) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(entry.conversation_id.clone(), entry.clone());
        Ok(())
    }

    async fn remove(&self, id: &ConversationId) -> Result<bool> {
        Ok(self.entries.lock().await.remove(id).is_some())
    }

    async fn entries(&self) -> Result<Vec<LedgerEntry>> {
        Ok(self.entries.lock().await.values().cloned().collect())
    }
}

/// SQL-backed ledger (sqlite or postgres through the `Any` driver).
#[derive(Debug, Clone)]
pub struct SqlLedgerStore {
    pool: AnyPool,
}

impl SqlLedgerStore {
    /// Connects and creates the ledger table if missing.
    pub async fn connect(database_url: &str) -> Result<Self> {
        sqlx::any::install_default_drivers();
        // one long-lived connection: `sqlite::memory:` databases die with their connection
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(database_url)
            .await
            .with_context(|| format!("connecting to ledger database {database_url}"))?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {LEDGER_TABLE} (
                convo_id TEXT PRIMARY KEY,
                payload_sent TEXT NOT NULL,
                updated_on BIGINT NOT NULL
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .with_context(|| format!("creating {LEDGER_TABLE}"))?;
        Ok(())
    }

    fn entry_from_row(row: &AnyRow) -> Result<LedgerEntry> {
        let convo_id: String = row.try_get("convo_id").context("reading convo_id")?;
        let payload_sent: String = row.try_get("payload_sent").context("reading payload_sent")?;
        let updated_on: i64 = row.try_get("updated_on").context("reading updated_on")?;
        let updated_on = DateTime::from_timestamp(updated_on, 0)
            .ok_or_else(|| anyhow!("updated_on {updated_on} out of range for {convo_id}"))?;
        Ok(LedgerEntry {
            conversation_id: ConversationId::new(convo_id),
            payload_sent,
            updated_on,
        })
    }
}

#[async_trait]
impl LedgerStore for SqlLedgerStore {
    async fn contains(&self, id: &ConversationId) -> Result<bool> {
        let row = sqlx::query(&format!(
            "SELECT convo_id FROM {LEDGER_TABLE} WHERE convo_id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("looking up ledger entry {id}"))?;
        Ok(row.is_some())
    }

    async fn all_ids(&self) -> Result<HashSet<ConversationId>> {
        let rows = sqlx::query(&format!("SELECT convo_id FROM {LEDGER_TABLE}"))
            .fetch_all(&self.pool)
            .await
            .context("listing ledger ids")?;
        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("convo_id")
                    .map(ConversationId::new)
                    .context("reading convo_id")
            })
            .collect()
    }

    async fn upsert(&self, entry: &LedgerEntry) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {LEDGER_TABLE} (convo_id, payload_sent, updated_on)
            VALUES ($1, $2, $3)
            ON CONFLICT (convo_id) DO UPDATE
               SET payload_sent = excluded.payload_sent,
                   updated_on = excluded.updated_on
            "#
        ))
        .bind(entry.conversation_id.as_str())
        .bind(entry.payload_sent.as_str())
        .bind(entry.updated_on.timestamp())
        .execute(&self.pool)
        .await
        .with_context(|| format!("upserting ledger entry {}", entry.conversation_id))?;
        Ok(())
    }

    async fn remove(&self, id: &ConversationId) -> Result<bool> {
        let result = sqlx::query(&format!("DELETE FROM {LEDGER_TABLE} WHERE convo_id = $1"))
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("removing ledger entry {id}"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn entries(&self) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT convo_id, payload_sent, updated_on FROM {LEDGER_TABLE} ORDER BY convo_id"
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing ledger entries")?;
        rows.iter().map(Self::entry_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn entry(id: &str, payload: &str, secs: i64) -> LedgerEntry {
        LedgerEntry {
            conversation_id: ConversationId::from(id),
            payload_sent: payload.to_string(),
            updated_on: Utc.timestamp_opt(secs, 0).single().unwrap(),
        }
    }

    async fn exercise_upsert_semantics(store: &dyn LedgerStore) {
        assert!(!store.contains(&"100".into()).await.unwrap());

        store.upsert(&entry("100", r#"{"customFields":[]}"#, 1_700_000_000)).await.unwrap();
        store.upsert(&entry("200", "first", 1_700_000_100)).await.unwrap();
        store.upsert(&entry("200", "second", 1_700_000_200)).await.unwrap();

        assert!(store.contains(&"100".into()).await.unwrap());
        let ids = store.all_ids().await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&ConversationId::from("200")));

        let entries = store.entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1], entry("200", "second", 1_700_000_200));

        assert!(store.remove(&"100".into()).await.unwrap());
        assert!(!store.remove(&"100".into()).await.unwrap());
        assert!(!store.contains(&"100".into()).await.unwrap());
    }

    #[tokio::test]
    async fn memory_ledger_upserts_by_id() {
        let store = MemoryLedgerStore::new();
        exercise_upsert_semantics(&store).await;
    }

    #[tokio::test]
    async fn sqlite_ledger_upserts_by_id() {
        let store = SqlLedgerStore::connect("sqlite::memory:").await.expect("connect");
        exercise_upsert_semantics(&store).await;
    }

    #[tokio::test]
    async fn sqlite_ledger_survives_reconnect() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("ledger.db").display());

        {
            let store = SqlLedgerStore::connect(&url).await.expect("connect");
            store.upsert(&entry("42", "payload", 1_700_000_000)).await.unwrap();
        }

        let reopened = SqlLedgerStore::connect(&url).await.expect("reconnect");
        assert!(reopened.contains(&"42".into()).await.unwrap());
        assert_eq!(reopened.entries().await.unwrap(), vec![entry("42", "payload", 1_700_000_000)]);
    }
}
