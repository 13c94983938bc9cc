use itertools::iproduct;
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SearchTask {
    pub subject: String,
    pub keyword: String,
    pub location: String,
}

impl SearchTask {
    pub fn new(subject: &str, keyword: &str, location: &str) -> Self {
        SearchTask {
            subject: subject.to_string(),
            keyword: keyword.to_string(),
            location: location.to_string(),
        }
    }

    pub fn query(&self) -> String {
        [&self.subject, &self.keyword, &self.location]
            .iter()
            .map(|part| part.trim())
            .filter(|part| !part.is_empty())
            .collect::<Vec<&str>>()
            .join(" ")
    }
}

fn clean_entries(entries: &[String]) -> Vec<String> {
    let mut cleaned: Vec<String> = vec![];
    for entry in entries.iter().map(|e| e.trim()) {
        if !entry.is_empty() && !cleaned.iter().any(|c| c == entry) {
            cleaned.push(entry.to_string());
        }
    }
    cleaned
}

/// Cross product of the configuration, subject-major, then location, then keyword.
pub fn generate_tasks(
    subjects: &[String],
    keywords: &[String],
    locations: &[String],
) -> Result<Vec<SearchTask>, HarvestError> {
    let subjects = clean_entries(subjects);
    let locations = clean_entries(locations);
    let mut keywords = clean_entries(keywords);

    if subjects.is_empty() {
        return Err(HarvestError::Configuration(
            "at least one subject is required".to_string(),
        ));
    }
    if locations.is_empty() {
        return Err(HarvestError::Configuration(
            "at least one location is required".to_string(),
        ));
    }
    if keywords.is_empty() {
        keywords.push(String::new());
    }

    Ok(iproduct!(subjects.iter(), locations.iter(), keywords.iter())
        .map(|(subject, location, keyword)| SearchTask::new(subject, keyword, location))
        .collect())
}
