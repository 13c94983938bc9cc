use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::domain::{LeadRecord, SearchTask};

#[derive(Debug, Clone)]
pub struct PersistenceOptions {
    pub attempts: u8,
    pub backoff: Duration,
}

impl Default for PersistenceOptions {
    fn default() -> Self {
        PersistenceOptions {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub total: usize,
}

/// Durable lead dataset keyed by canonical phone. Every write is a merge.
#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn merge(&self, batch: &[LeadRecord]) -> anyhow::Result<MergeReport>;
    /// All records, ordered by `observed_at` then phone.
    async fn load(&self) -> anyhow::Result<Vec<LeadRecord>>;
}

/// Union by canonical phone. The newer observation wins and ties go to the
/// incoming record.
pub fn merge_records(
    existing: &mut HashMap<String, LeadRecord>,
    batch: &[LeadRecord],
) -> MergeReport {
    let mut report = MergeReport::default();

    for record in batch {
        let keep_current = existing
            .get(&record.canonical_phone)
            .map(|current| current.observed_at > record.observed_at || current == record);

        match keep_current {
            None => {
                existing.insert(record.canonical_phone.clone(), record.clone());
                report.inserted += 1;
            }
            Some(true) => report.unchanged += 1,
            Some(false) => {
                existing.insert(record.canonical_phone.clone(), record.clone());
                report.updated += 1;
            }
        }
    }

    report.total = existing.len();
    report
}

pub fn ordered(records: impl IntoIterator<Item = LeadRecord>) -> Vec<LeadRecord> {
    let mut records: Vec<LeadRecord> = records.into_iter().collect();
    records.sort_by(|a, b| {
        (a.observed_at, &a.canonical_phone).cmp(&(b.observed_at, &b.canonical_phone))
    });
    records
}

pub struct PersistantData {
    pub task: Arc<SearchTask>,
    pub records: Vec<LeadRecord>,
}

#[derive(Debug, Default)]
pub struct PersistenceReport {
    pub persisted: usize,
    pub unpersisted: Vec<LeadRecord>,
}

/// Sole writer of the dataset for one run. Batches that cannot be merged
/// after every retry are carried into the next flush.
pub async fn data_persistance_handler(
    mut data_receiver: UnboundedReceiver<PersistantData>,
    store: Arc<dyn LeadStore>,
    options: PersistenceOptions,
) -> PersistenceReport {
    log::info!("Started data persistance handler");

    let mut report = PersistenceReport::default();
    let mut pending: Vec<LeadRecord> = vec![];

    while let Some(data) = data_receiver.recv().await {
        log::info!(
            "Data persistance handler received {} leads for '{}'",
            data.records.len(),
            data.task.query()
        );
        pending.extend(data.records);
        flush_pending(&mut pending, &mut report, store.as_ref(), &options).await;
    }

    report.unpersisted = pending;
    if !report.unpersisted.is_empty() {
        log::error!(
            "{} leads could not be persisted this run",
            report.unpersisted.len()
        );
    }
    log::info!("Data persistance handler finished, {} leads persisted", report.persisted);

    report
}

async fn flush_pending(
    pending: &mut Vec<LeadRecord>,
    report: &mut PersistenceReport,
    store: &dyn LeadStore,
    options: &PersistenceOptions,
) {
    if pending.is_empty() {
        return;
    }

    let attempts = options.attempts.max(1);
    for attempt in 1..=attempts {
        match store.merge(pending).await {
            Ok(merge) => {
                log::info!(
                    "Merged {} leads: {} new, {} updated, {} unchanged, dataset has {}",
                    pending.len(),
                    merge.inserted,
                    merge.updated,
                    merge.unchanged,
                    merge.total
                );
                report.persisted += pending.len();
                pending.clear();
                return;
            }
            Err(e) => {
                log::warn!(
                    "Merging {} leads failed (attempt {}/{}): {:?}",
                    pending.len(),
                    attempt,
                    attempts,
                    e
                );
                if attempt < attempts {
                    tokio::time::sleep(options.backoff).await;
                }
            }
        }
    }

    log::error!("Carrying {} unpersisted leads into the next flush", pending.len());
}
