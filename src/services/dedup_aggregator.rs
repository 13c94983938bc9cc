use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use crate::domain::LeadRecord;

#[cfg(test)]
use super::ordered;

/// Run-wide canonical phone index. First offer for a phone wins.
#[derive(Default)]
pub struct DedupIndex {
    leads: Mutex<HashMap<String, LeadRecord>>,
    accepted: AtomicUsize,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&self, record: LeadRecord) -> bool {
        let mut leads = match self.leads.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if leads.contains_key(&record.canonical_phone) {
            return false;
        }
        leads.insert(record.canonical_phone.clone(), record);
        self.accepted.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> Vec<LeadRecord> {
        let leads = match self.leads.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ordered(leads.values().cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::DedupIndex;
    use crate::domain::LeadRecord;

    fn lead(company: &str, phone: &str) -> LeadRecord {
        LeadRecord {
            company: company.to_string(),
            canonical_phone: phone.to_string(),
            location: "Jodhpur".to_string(),
            keyword: "dealer".to_string(),
            source_link: format!("https://maps.example.com/maps/place/{}", company),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn same_phone_is_accepted_once() {
        let index = DedupIndex::new();

        assert!(index.offer(lead("Alpha", "9876543210")));
        assert!(!index.offer(lead("Alpha Branch", "9876543210")));
        assert!(index.offer(lead("Beta", "9123456780")));

        assert_eq!(index.accepted_count(), 2);
        let snapshot = index.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().any(|r| r.company == "Alpha"));
        assert!(!snapshot.iter().any(|r| r.company == "Alpha Branch"));
    }

    #[test]
    fn concurrent_offers_accept_exactly_one() {
        let index = Arc::new(DedupIndex::new());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let index = index.clone();
                std::thread::spawn(move || {
                    index.offer(lead(&format!("Worker {}", i), "9876543210"))
                })
            })
            .collect();
        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|accepted| *accepted)
            .count();

        assert_eq!(accepted, 1);
        assert_eq!(index.accepted_count(), 1);
    }
}
