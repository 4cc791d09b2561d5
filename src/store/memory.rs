//! In-memory store, used by tests and throwaway deployments

use crate::common::{PersistedNumber, Result, WorkerCount, WorkerId};
use crate::store::NumberStore;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Mutex;

pub struct MemoryStore {
    records: Mutex<Vec<PersistedNumber>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of everything stored so far
    pub fn records(&self) -> Vec<PersistedNumber> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl NumberStore for MemoryStore {
    fn persist(&self, worker_id: WorkerId, value: i64) -> Result<PersistedNumber> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = PersistedNumber {
            id: records.len() as u64 + 1,
            worker_id,
            value,
            created_at: Utc::now(),
        };
        records.push(record.clone());
        Ok(record)
    }

    fn sum_for(&self, worker_id: WorkerId) -> Result<i64> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.worker_id == worker_id)
            .fold(0i64, |acc, r| acc.saturating_add(r.value)))
    }

    fn counts_by_worker(&self) -> Result<Vec<WorkerCount>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut counts: BTreeMap<WorkerId, u64> = BTreeMap::new();
        for record in records.iter() {
            *counts.entry(record.worker_id).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(worker_id, items)| WorkerCount { worker_id, items })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> WorkerId {
        WorkerId::new(n).unwrap()
    }

    #[test]
    fn test_sums_are_per_worker() {
        let store = MemoryStore::new();
        store.persist(id(1), 2).unwrap();
        store.persist(id(2), 3).unwrap();
        store.persist(id(2), 2).unwrap();

        assert_eq!(store.sum_for(id(1)).unwrap(), 2);
        assert_eq!(store.sum_for(id(2)).unwrap(), 5);
        assert_eq!(store.sum_for(id(3)).unwrap(), 0);
    }

    #[test]
    fn test_counts_ordered_by_worker() {
        let store = MemoryStore::new();
        store.persist(id(3), 1).unwrap();
        store.persist(id(1), 1).unwrap();
        store.persist(id(3), 1).unwrap();

        let counts = store.counts_by_worker().unwrap();
        assert_eq!(
            counts,
            vec![
                WorkerCount {
                    worker_id: id(1),
                    items: 1
                },
                WorkerCount {
                    worker_id: id(3),
                    items: 2
                },
            ]
        );
    }
}
