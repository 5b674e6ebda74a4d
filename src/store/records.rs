//! RecordStore — forwarding records plus a reactive list snapshot.
//!
//! Every mutation reloads the full record list into a `watch` channel, so
//! subscribers (the HTTP API, tests) always see complete states, never
//! incremental patches. Single writer, many readers.

use std::sync::Arc;

use chrono::Utc;
use libsql::params;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::{DeliveryStatus, ForwardingRecord};
use crate::store::db::Database;

/// Persistent forwarding-record storage.
pub struct RecordStore {
    db: Arc<Database>,
    snapshot: watch::Sender<Arc<Vec<ForwardingRecord>>>,
}

impl RecordStore {
    /// Create the store and load the initial snapshot.
    pub async fn new(db: Arc<Database>) -> Result<Self, DatabaseError> {
        let initial = load_all(&db).await?;
        let (snapshot, _) = watch::channel(Arc::new(initial));
        Ok(Self { db, snapshot })
    }

    /// Subscribe to record-list snapshots. The receiver is primed with the
    /// current list.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<ForwardingRecord>>> {
        self.snapshot.subscribe()
    }

    /// The current snapshot (newest records first).
    pub fn snapshot(&self) -> Arc<Vec<ForwardingRecord>> {
        self.snapshot.borrow().clone()
    }

    /// Query the full list from the database (newest first).
    pub async fn get_all(&self) -> Result<Vec<ForwardingRecord>, DatabaseError> {
        load_all(&self.db).await
    }

    /// Load a single record, or `None`.
    pub async fn get(&self, id: Uuid) -> Result<Option<ForwardingRecord>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT id, msg_address, msg_body, status, is_fulfilled, result_description,
                        created_at, updated_at
                 FROM forwarding_records WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get record: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("read record: {e}")))?
        {
            Some(row) => Ok(Some(row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    /// Insert a fresh `Pending` record for a received message.
    pub async fn add(&self, address: &str, body: &str) -> Result<ForwardingRecord, DatabaseError> {
        let record = ForwardingRecord {
            id: Uuid::new_v4(),
            address: address.to_string(),
            body: body.to_string(),
            status: DeliveryStatus::Pending,
            is_fulfilled: false,
            result_description: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        self.db
            .conn()
            .execute(
                "INSERT INTO forwarding_records
                     (id, msg_address, msg_body, status, is_fulfilled, result_description,
                      created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id.to_string(),
                    record.address.clone(),
                    record.body.clone(),
                    status_to_str(record.status),
                    record.is_fulfilled as i64,
                    record.result_description.clone(),
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert record: {e}")))?;

        debug!(record_id = %record.id, address = %address, "Forwarding record created");
        self.refresh_snapshot().await?;
        Ok(record)
    }

    /// Conclude a record: move it from `Pending` to a terminal status.
    ///
    /// Returns `true` if the transition happened, `false` if the record was
    /// already terminal (the stored outcome is kept — records are written
    /// exactly once). Missing record is an error.
    pub async fn conclude(
        &self,
        id: Uuid,
        status: DeliveryStatus,
        description: &str,
    ) -> Result<bool, DatabaseError> {
        let affected = self
            .db
            .conn()
            .execute(
                "UPDATE forwarding_records
                 SET status = ?1, is_fulfilled = ?2, result_description = ?3, updated_at = ?4
                 WHERE id = ?5 AND status = 'PENDING'",
                params![
                    status_to_str(status),
                    status.is_fulfilled() as i64,
                    description,
                    Utc::now().to_rfc3339(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("conclude record: {e}")))?;

        if affected == 0 {
            // Either missing or already concluded — distinguish the two.
            return match self.get(id).await? {
                Some(_) => Ok(false),
                None => Err(DatabaseError::NotFound {
                    entity: "forwarding_record".into(),
                    id: id.to_string(),
                }),
            };
        }

        info!(
            record_id = %id,
            status = status.label(),
            "Forwarding record concluded"
        );
        self.refresh_snapshot().await?;
        Ok(true)
    }

    /// Delete a record. Returns `false` if it did not exist.
    pub async fn delete(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let affected = self
            .db
            .conn()
            .execute(
                "DELETE FROM forwarding_records WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete record: {e}")))?;

        if affected > 0 {
            self.refresh_snapshot().await?;
        }
        Ok(affected > 0)
    }

    async fn refresh_snapshot(&self) -> Result<(), DatabaseError> {
        let records = load_all(&self.db).await?;
        self.snapshot.send_replace(Arc::new(records));
        Ok(())
    }
}

async fn load_all(db: &Database) -> Result<Vec<ForwardingRecord>, DatabaseError> {
    let mut rows = db
        .conn()
        .query(
            "SELECT id, msg_address, msg_body, status, is_fulfilled, result_description,
                    created_at, updated_at
             FROM forwarding_records ORDER BY created_at DESC, id DESC",
            (),
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("load records: {e}")))?;

    let mut records = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        records.push(row_to_record(&row)?);
    }
    Ok(records)
}

/// Map a libsql Row to a ForwardingRecord.
///
/// Column order: 0:id, 1:msg_address, 2:msg_body, 3:status, 4:is_fulfilled,
/// 5:result_description, 6:created_at, 7:updated_at
fn row_to_record(row: &libsql::Row) -> Result<ForwardingRecord, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("record id column: {e}")))?;
    let address: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("msg_address column: {e}")))?;
    let body: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("msg_body column: {e}")))?;
    let status_str: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("status column: {e}")))?;
    let is_fulfilled: i64 = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("is_fulfilled column: {e}")))?;
    let description: String = row
        .get(5)
        .map_err(|e| DatabaseError::Query(format!("result_description column: {e}")))?;
    let created_str: String = row
        .get(6)
        .map_err(|e| DatabaseError::Query(format!("created_at column: {e}")))?;
    let updated_str: String = row
        .get(7)
        .map_err(|e| DatabaseError::Query(format!("updated_at column: {e}")))?;

    Ok(ForwardingRecord {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        address,
        body,
        status: str_to_status(&status_str),
        is_fulfilled: is_fulfilled != 0,
        result_description: description,
        created_at: super::parse_datetime(&created_str),
        updated_at: super::parse_datetime(&updated_str),
    })
}

/// Convert a DeliveryStatus to its DB string.
fn status_to_str(status: DeliveryStatus) -> &'static str {
    match status {
        DeliveryStatus::Pending => "PENDING",
        DeliveryStatus::Success => "SUCCESS",
        DeliveryStatus::PartialSuccess => "PARTIAL_SUCCESS",
        DeliveryStatus::Failure => "FAILURE",
    }
}

/// Parse a status string from the DB.
fn str_to_status(s: &str) -> DeliveryStatus {
    match s {
        "SUCCESS" => DeliveryStatus::Success,
        "PARTIAL_SUCCESS" => DeliveryStatus::PartialSuccess,
        "FAILURE" => DeliveryStatus::Failure,
        _ => DeliveryStatus::Pending,
    }
}
