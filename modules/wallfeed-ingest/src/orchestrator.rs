// Drives the ingestion engine over a set of sources, once or forever.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use tracing::info;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use wallfeed_common::config::{DEFAULT_LOOP_DELAY_SECS, DEFAULT_PAGE_LIMIT};
use wallfeed_common::validate_domain;

use crate::engine::{IngestRequest, IngestSummary, Ingestor};

/// Order in which a pass visits its sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceOrder {
    Fixed,
    Shuffled,
}

/// Per-source settings shared by every source in a pass.
#[derive(Debug, Clone, TypedBuilder)]
pub struct PassOptions {
    #[builder(default = DEFAULT_PAGE_LIMIT)]
    pub max_pages: u32,
    #[builder(default)]
    pub force: bool,
    #[builder(default)]
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub struct PassSummary {
    pub run_id: Uuid,
    pub sources: Vec<IngestSummary>,
}

impl PassSummary {
    pub fn posts_added(&self) -> usize {
        self.sources.iter().map(|s| s.posts_added).sum()
    }
}

#[derive(TypedBuilder)]
pub struct Orchestrator {
    ingestor: Arc<Ingestor>,
    #[builder(default = SourceOrder::Fixed)]
    order: SourceOrder,
    #[builder(default = Duration::from_secs(DEFAULT_LOOP_DELAY_SECS))]
    loop_delay: Duration,
}

impl Orchestrator {
    /// One bounded pass: every source once, each to its stop condition.
    /// Sources are validated before any fetch. Cancellation is checked
    /// between pages and between sources.
    pub async fn run_once(
        &self,
        domains: &[String],
        options: &PassOptions,
        cancel: &CancellationToken,
    ) -> Result<PassSummary> {
        for domain in domains {
            validate_domain(domain)?;
        }

        let mut ordered = domains.to_vec();
        if self.order == SourceOrder::Shuffled {
            ordered.shuffle(&mut rand::rng());
        }

        let run_id = Uuid::new_v4();
        info!(run_id = %run_id, sources = ordered.len(), "Starting pass");

        let mut sources = Vec::with_capacity(ordered.len());
        for domain in ordered {
            if cancel.is_cancelled() {
                info!(run_id = %run_id, "Pass cancelled");
                break;
            }
            let request = IngestRequest {
                domain,
                offset: options.offset,
                max_pages: options.max_pages,
                force: options.force,
                until: None,
                run_id,
                cancel: cancel.clone(),
            };
            let summary = self
                .ingestor
                .ingest_one(&request)
                .await
                .with_context(|| format!("Ingestion of {} failed", request.domain))?;
            sources.push(summary);
        }

        let pass = PassSummary { run_id, sources };
        info!(
            run_id = %run_id,
            sources = pass.sources.len(),
            posts_added = pass.posts_added(),
            "Pass complete"
        );
        Ok(pass)
    }

    /// Continuous mode: bounded passes separated by the loop delay, until
    /// `cancel` fires. Returns the number of completed passes.
    pub async fn run_forever(
        &self,
        domains: &[String],
        options: &PassOptions,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut passes = 0;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.run_once(domains, options, cancel).await?;
            passes += 1;

            info!(passes, sleep_secs = self.loop_delay.as_secs(), "Sleeping before next pass");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.loop_delay) => {}
            }
        }
        info!(passes, "Listener stopped");
        Ok(passes)
    }
}
