//! Identifier index over a dataset snapshot.

use crate::dataset::DatasetRecord;
use std::collections::HashMap;
use std::sync::Arc;

/// Maps an identifier to the positions of every record carrying it as
/// subject or agent identifier. Built once per snapshot.
#[derive(Debug, Default)]
pub struct RecordIndex {
    records: Vec<Arc<DatasetRecord>>,
    by_identifier: HashMap<String, Vec<usize>>,
}

impl RecordIndex {
    pub fn build(records: &[Arc<DatasetRecord>]) -> Self {
        let mut by_identifier: HashMap<String, Vec<usize>> = HashMap::new();

        for (position, record) in records.iter().enumerate() {
            if let Some(subject) = &record.subject_id {
                by_identifier
                    .entry(subject.clone())
                    .or_default()
                    .push(position);
            }
            if let Some(agent) = &record.agent_id {
                // Same identifier in both fields still yields the record once
                if record.subject_id.as_deref() != Some(agent.as_str()) {
                    by_identifier.entry(agent.clone()).or_default().push(position);
                }
            }
        }

        Self {
            records: records.to_vec(),
            by_identifier,
        }
    }

    /// Records matching `identifier`, in dataset order.
    pub fn lookup(&self, identifier: &str) -> Vec<Arc<DatasetRecord>> {
        let Some(positions) = self.by_identifier.get(identifier.trim()) else {
            return Vec::new();
        };

        // Positions are pushed in scan order, so they are already ascending
        positions
            .iter()
            .map(|&position| Arc::clone(&self.records[position]))
            .collect()
    }

    pub fn identifier_count(&self) -> usize {
        self.by_identifier.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
