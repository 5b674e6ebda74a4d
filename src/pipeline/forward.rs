//! Forward stage — one backend round trip per record, one terminal update.
//!
//! The error split matters here: a backend-reported or transport failure is
//! a recorded *outcome* (the record goes to Failure and the job succeeds),
//! while a missing record or missing settings is a job-level failure the
//! runner may retry, because nothing has been mutated yet.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::backend::{BackendClient, ForwardRequest};
use crate::error::JobError;
use crate::jobs::{JobHandler, JobKind};
use crate::pipeline::types::{DeliveryStatus, ForwardJob};
use crate::store::{RecordStore, SettingsStore};

/// Handler for `forward` jobs.
pub struct ForwardStage {
    records: Arc<RecordStore>,
    settings: Arc<SettingsStore>,
    backend: Arc<dyn BackendClient>,
}

impl ForwardStage {
    pub fn new(
        records: Arc<RecordStore>,
        settings: Arc<SettingsStore>,
        backend: Arc<dyn BackendClient>,
    ) -> Self {
        Self {
            records,
            settings,
            backend,
        }
    }
}

#[async_trait]
impl JobHandler for ForwardStage {
    fn kind(&self) -> &'static str {
        JobKind::Forward.as_str()
    }

    async fn execute(&self, payload: &str) -> Result<(), JobError> {
        let job: ForwardJob = serde_json::from_str(payload)
            .map_err(|e| JobError::MalformedPayload(format!("forward payload: {e}")))?;
        let Some(type_key) = job.type_keys.first() else {
            return Err(JobError::MalformedPayload(
                "forward job carries no type keys".into(),
            ));
        };

        let record = self.records.get(job.record_id).await?.ok_or_else(|| {
            JobError::Precondition(format!("record {} not found", job.record_id))
        })?;

        if record.status.is_terminal() {
            // Redelivered job. The outcome is already on the record; calling
            // the backend again would forward the message twice.
            debug!(record_id = %record.id, "Record already concluded, skipping");
            return Ok(());
        }

        let settings = self.settings.snapshot();
        let sender_key = settings
            .sender_key
            .ok_or_else(|| JobError::Precondition("sender key is not configured".into()))?;
        let bot_url = settings
            .bot_url
            .ok_or_else(|| JobError::Precondition("bot URL is not configured".into()))?;

        // Only the first type key goes out, even when several rules matched.
        // The backend accepts a single classification per forward.
        let request = ForwardRequest {
            address: record.address.clone(),
            body: record.body.clone(),
            sender_key,
            type_key: type_key.clone(),
        };

        let (status, description) = match self.backend.forward(&bot_url, &request).await {
            Ok(response) => (response.delivery_status(), response.result_description),
            Err(e) => {
                warn!(record_id = %record.id, error = %e, "Backend call failed");
                (DeliveryStatus::Failure, e.to_string())
            }
        };

        let transitioned = self
            .records
            .conclude(record.id, status, &description)
            .await?;
        if transitioned {
            info!(
                record_id = %record.id,
                status = status.label(),
                "Forward concluded"
            );
        } else {
            warn!(record_id = %record.id, "Record was concluded by an earlier attempt");
        }
        Ok(())
    }
}
