//! Intake stage — turns a raw message into a pending record and a queued
//! forward, or into nothing at all.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::JobError;
use crate::jobs::{JobHandler, JobKind, JobQueue};
use crate::pipeline::rules::matching_rules;
use crate::pipeline::types::{ForwardJob, IntakeJob};
use crate::store::{RecordStore, RuleStore};

/// Handler for `intake` jobs.
pub struct IntakeStage {
    rules: Arc<RuleStore>,
    records: Arc<RecordStore>,
    queue: Arc<JobQueue>,
}

impl IntakeStage {
    pub fn new(rules: Arc<RuleStore>, records: Arc<RecordStore>, queue: Arc<JobQueue>) -> Self {
        Self {
            rules,
            records,
            queue,
        }
    }
}

#[async_trait]
impl JobHandler for IntakeStage {
    fn kind(&self) -> &'static str {
        JobKind::Intake.as_str()
    }

    async fn execute(&self, payload: &str) -> Result<(), JobError> {
        let job: IntakeJob = serde_json::from_str(payload)
            .map_err(|e| JobError::MalformedPayload(format!("intake payload: {e}")))?;

        // Nothing is persisted before the record insert below, so store
        // failures up to that point are clean retries.
        let rules = self.rules.get_all().await?;
        let matched = matching_rules(&job.address, &job.body, &rules);
        if matched.is_empty() {
            debug!(address = %job.address, "No rule matched, message dropped");
            return Ok(());
        }

        // Distinct type keys in match order. The forward stage submits only
        // the first; the rest ride along for the record of what matched.
        let mut type_keys: Vec<String> = Vec::new();
        for rule in &matched {
            if !type_keys.iter().any(|k| k == &rule.type_key) {
                type_keys.push(rule.type_key.clone());
            }
        }

        let record = self.records.add(&job.address, &job.body).await?;

        // If the process dies between the insert above and this enqueue, the
        // record stays Pending with no forward job to conclude it. Nothing
        // re-drives such records; they remain visible as Pending.
        self.queue
            .enqueue(
                JobKind::Forward,
                &ForwardJob {
                    record_id: record.id,
                    type_keys,
                },
            )
            .await?;

        info!(
            record_id = %record.id,
            address = %job.address,
            matched = matched.len(),
            "Message matched, forward queued"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::rules::{FilterKind, NewFilter, NewRule};
    use crate::pipeline::types::DeliveryStatus;
    use crate::store::Database;
    use std::time::Duration;

    async fn setup() -> (IntakeStage, Arc<RuleStore>, Arc<RecordStore>, Arc<JobQueue>) {
        let db = Arc::new(Database::new_memory().await.unwrap());
        let rules = Arc::new(RuleStore::new(db.clone()));
        let records = Arc::new(RecordStore::new(db.clone()).await.unwrap());
        let queue = Arc::new(JobQueue::new(db));
        let stage = IntakeStage::new(rules.clone(), records.clone(), queue.clone());
        (stage, rules, records, queue)
    }

    fn payload(address: &str, body: &str) -> String {
        serde_json::to_string(&IntakeJob {
            address: address.into(),
            body: body.into(),
        })
        .unwrap()
    }

    fn bank_rule(type_key: &str) -> NewRule {
        NewRule {
            name: format!("bank {type_key}"),
            type_key: type_key.into(),
            addresses: vec!["12345".into()],
            filters: vec![NewFilter {
                kind: FilterKind::Include,
                text: "code".into(),
                ignore_case: false,
            }],
        }
    }

    #[tokio::test]
    async fn unmatched_message_creates_nothing() {
        let (stage, rules, records, queue) = setup().await;
        rules.add(bank_rule("t1")).await.unwrap();

        stage
            .execute(&payload("99999", "anything"))
            .await
            .unwrap();

        assert!(records.get_all().await.unwrap().is_empty());
        assert!(queue.claim_due().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn matched_message_creates_record_and_forward_job() {
        let (stage, rules, records, queue) = setup().await;
        rules.add(bank_rule("t1")).await.unwrap();

        stage
            .execute(&payload("12345", "Your code is 5521"))
            .await
            .unwrap();

        let all = records.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].address, "12345");
        assert_eq!(all[0].body, "Your code is 5521");
        assert_eq!(all[0].status, DeliveryStatus::Pending);
        assert_eq!(all[0].result_description, "");

        let job = queue.claim_due().await.unwrap().unwrap();
        assert_eq!(job.kind, "forward");
        let forward: ForwardJob = serde_json::from_str(&job.payload).unwrap();
        assert_eq!(forward.record_id, all[0].id);
        assert_eq!(forward.type_keys, vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn filtered_out_message_creates_nothing() {
        let (stage, rules, records, queue) = setup().await;
        rules.add(bank_rule("t1")).await.unwrap();

        // Right address, but the body lacks the INCLUDE text
        stage
            .execute(&payload("12345", "balance update"))
            .await
            .unwrap();

        assert!(records.get_all().await.unwrap().is_empty());
        assert!(queue.claim_due().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_type_keys_collapse_in_match_order() {
        let (stage, rules, _records, queue) = setup().await;
        let unfiltered = |name: &str, type_key: &str| NewRule {
            name: name.into(),
            type_key: type_key.into(),
            addresses: vec!["12345".into()],
            filters: vec![],
        };
        rules.add(unfiltered("first", "t1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        rules.add(unfiltered("second", "t2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        rules.add(unfiltered("third", "t1")).await.unwrap();

        stage.execute(&payload("12345", "hello")).await.unwrap();

        let job = queue.claim_due().await.unwrap().unwrap();
        let forward: ForwardJob = serde_json::from_str(&job.payload).unwrap();
        assert_eq!(forward.type_keys, vec!["t1".to_string(), "t2".to_string()]);
    }

    #[tokio::test]
    async fn identical_messages_each_get_their_own_record() {
        let (stage, rules, records, queue) = setup().await;
        rules.add(bank_rule("t1")).await.unwrap();

        stage
            .execute(&payload("12345", "Your code is 5521"))
            .await
            .unwrap();
        stage
            .execute(&payload("12345", "Your code is 5521"))
            .await
            .unwrap();

        assert_eq!(records.get_all().await.unwrap().len(), 2);
        assert!(queue.claim_due().await.unwrap().is_some());
        assert!(queue.claim_due().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn malformed_payload_is_fatal() {
        let (stage, _rules, records, _queue) = setup().await;

        let err = stage.execute("not json").await.unwrap_err();
        assert!(matches!(err, JobError::MalformedPayload(_)));
        assert!(err.is_fatal());

        // Required field missing
        let err = stage.execute(r#"{"address": "12345"}"#).await.unwrap_err();
        assert!(err.is_fatal());

        assert!(records.get_all().await.unwrap().is_empty());
    }
}
