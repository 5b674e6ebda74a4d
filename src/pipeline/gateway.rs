//! Ingress gateway — the single method message sources call.
//!
//! `handle_received_message` is the durability boundary: once it returns
//! Ok, the message lives in the jobs table and survives a crash. Everything
//! after that point is driven by the job runner.

use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use crate::jobs::{JobKind, JobQueue};
use crate::pipeline::types::IntakeJob;

/// Hands raw messages off to the intake stage.
pub struct RelayGateway {
    queue: Arc<JobQueue>,
}

impl RelayGateway {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self { queue }
    }

    /// Accept one received message for rule evaluation.
    ///
    /// No matching, no record yet — just an enqueue. The intake stage does
    /// the rest on its own schedule.
    pub async fn handle_received_message(&self, address: &str, body: &str) -> Result<()> {
        let job = self
            .queue
            .enqueue(
                JobKind::Intake,
                &IntakeJob {
                    address: address.to_string(),
                    body: body.to_string(),
                },
            )
            .await?;

        info!(job_id = %job.id, address = %address, "Message accepted");
        Ok(())
    }
}
