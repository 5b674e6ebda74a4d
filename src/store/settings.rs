//! SettingsStore — the user-supplied backend settings as a reactive snapshot.
//!
//! Two keys live here: `bot_url` and `sender_key`. Both are absent until the
//! user configures them; the forward stage treats an absent value as a
//! retryable precondition failure, so writing a setting heals queued jobs.

use std::sync::Arc;

use libsql::params;
use tokio::sync::watch;
use tracing::info;

use crate::error::DatabaseError;
use crate::pipeline::types::RelaySettings;
use crate::store::db::Database;

const KEY_BOT_URL: &str = "bot_url";
const KEY_SENDER_KEY: &str = "sender_key";

/// Persistent settings storage with a `watch`-based snapshot.
pub struct SettingsStore {
    db: Arc<Database>,
    snapshot: watch::Sender<RelaySettings>,
}

impl SettingsStore {
    /// Create the store and load the initial snapshot.
    pub async fn new(db: Arc<Database>) -> Result<Self, DatabaseError> {
        let initial = load(&db).await?;
        let (snapshot, _) = watch::channel(initial);
        Ok(Self { db, snapshot })
    }

    /// The current settings.
    pub fn snapshot(&self) -> RelaySettings {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to settings changes. The receiver is primed with the
    /// current value.
    pub fn subscribe(&self) -> watch::Receiver<RelaySettings> {
        self.snapshot.subscribe()
    }

    /// Set or clear the backend URL. `None` (or a blank string) clears it.
    pub async fn set_bot_url(&self, value: Option<&str>) -> Result<(), DatabaseError> {
        self.write_key(KEY_BOT_URL, value).await
    }

    /// Set or clear the sender key. `None` (or a blank string) clears it.
    pub async fn set_sender_key(&self, value: Option<&str>) -> Result<(), DatabaseError> {
        self.write_key(KEY_SENDER_KEY, value).await
    }

    async fn write_key(&self, key: &str, value: Option<&str>) -> Result<(), DatabaseError> {
        let conn = self.db.conn();
        let trimmed = value.map(str::trim).filter(|v| !v.is_empty());

        match trimmed {
            Some(v) => {
                conn.execute(
                    "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                     ON CONFLICT (key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
                    params![key, v],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("write setting: {e}")))?;
            }
            None => {
                conn.execute("DELETE FROM settings WHERE key = ?1", params![key])
                    .await
                    .map_err(|e| DatabaseError::Query(format!("clear setting: {e}")))?;
            }
        }

        info!(key = %key, set = trimmed.is_some(), "Setting updated");
        self.refresh_snapshot().await
    }

    async fn refresh_snapshot(&self) -> Result<(), DatabaseError> {
        let settings = load(&self.db).await?;
        self.snapshot.send_replace(settings);
        Ok(())
    }
}

async fn load(db: &Database) -> Result<RelaySettings, DatabaseError> {
    let mut rows = db
        .conn()
        .query("SELECT key, value FROM settings", ())
        .await
        .map_err(|e| DatabaseError::Query(format!("load settings: {e}")))?;

    let mut settings = RelaySettings::default();
    while let Ok(Some(row)) = rows.next().await {
        let key: String = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("setting key column: {e}")))?;
        let value: String = row
            .get(1)
            .map_err(|e| DatabaseError::Query(format!("setting value column: {e}")))?;

        match key.as_str() {
            KEY_BOT_URL => settings.bot_url = Some(value),
            KEY_SENDER_KEY => settings.sender_key = Some(value),
            // Unknown keys are tolerated (older/newer schema versions)
            _ => {}
        }
    }
    Ok(settings)
}
