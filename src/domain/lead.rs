use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::search_task::SearchTask;

pub const UNKNOWN_COMPANY: &str = "Unknown Business";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CandidateLink {
    pub url: String,
    pub origin: Arc<SearchTask>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhoneStrategy {
    AccessibleLabel,
    DataAttribute,
    InfoText,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawExtraction {
    pub name: Option<String>,
    pub raw_phone: Option<String>,
    pub phone_strategy: Option<PhoneStrategy>,
}

impl RawExtraction {
    pub fn company(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| UNKNOWN_COMPANY.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadRecord {
    pub company: String,
    pub canonical_phone: String,
    pub location: String,
    pub keyword: String,
    pub source_link: String,
    pub observed_at: DateTime<Utc>,
}

impl LeadRecord {
    pub fn from_extraction(
        extraction: &RawExtraction,
        canonical_phone: String,
        link: &CandidateLink,
        observed_at: DateTime<Utc>,
    ) -> Self {
        LeadRecord {
            company: extraction.company(),
            canonical_phone,
            location: link.origin.location.clone(),
            keyword: link.origin.keyword.clone(),
            source_link: link.url.clone(),
            observed_at,
        }
    }
}
