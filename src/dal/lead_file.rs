use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    domain::LeadRecord,
    services::{merge_records, ordered, LeadStore, MergeReport},
};

/// Lead dataset kept as one JSON array. Writes go to a sibling temp file that
/// is renamed over the dataset.
pub struct JsonLeadStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLeadStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonLeadStore {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "leads.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn read_dataset(&self) -> anyhow::Result<HashMap<String, LeadRecord>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };

        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(HashMap::new());
        }

        let records: Vec<LeadRecord> = serde_json::from_slice(&bytes)
            .with_context(|| format!("{} is not a lead dataset", self.path.display()))?;

        let mut dataset = HashMap::new();
        merge_records(&mut dataset, &records);
        Ok(dataset)
    }

    async fn write_dataset(&self, records: &[LeadRecord]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let temp_path = self.temp_path();
        let bytes = serde_json::to_vec_pretty(records).context("Failed to encode leads")?;
        tokio::fs::write(&temp_path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", temp_path.display()))?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        Ok(())
    }
}

#[async_trait]
impl LeadStore for JsonLeadStore {
    async fn merge(&self, batch: &[LeadRecord]) -> anyhow::Result<MergeReport> {
        let _guard = self.write_lock.lock().await;

        let mut dataset = self.read_dataset().await?;
        let report = merge_records(&mut dataset, batch);
        let exists = tokio::fs::try_exists(&self.path).await.unwrap_or(false);

        if report.inserted + report.updated > 0 || !exists {
            self.write_dataset(&ordered(dataset.into_values())).await?;
        }

        Ok(report)
    }

    async fn load(&self) -> anyhow::Result<Vec<LeadRecord>> {
        Ok(ordered(self.read_dataset().await?.into_values()))
    }
}
