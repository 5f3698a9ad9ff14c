//! In-flight references held by routing decisions.
//!
//! A [`SelectionLease`] is handed out with every selection and released on
//! drop. While any lease for a model is alive the registry refuses to delete
//! it.

use std::sync::Arc;

use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct InFlightLeases {
    counts: DashMap<String, usize>,
}

impl InFlightLeases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(self: &Arc<Self>, model_id: &str) -> SelectionLease {
        *self.counts.entry(model_id.to_string()).or_insert(0) += 1;
        SelectionLease {
            leases: Arc::clone(self),
            model_id: model_id.to_string(),
        }
    }

    pub fn count(&self, model_id: &str) -> usize {
        self.counts.get(model_id).map(|c| *c).unwrap_or(0)
    }

    fn release(&self, model_id: &str) {
        if let Some(mut count) = self.counts.get_mut(model_id) {
            *count = count.saturating_sub(1);
        }
        self.counts.remove_if(model_id, |_, count| *count == 0);
    }
}

/// Marks a model as referenced by an in-flight routing decision.
#[derive(Debug)]
pub struct SelectionLease {
    leases: Arc<InFlightLeases>,
    model_id: String,
}

impl SelectionLease {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

impl Drop for SelectionLease {
    fn drop(&mut self) {
        self.leases.release(&self.model_id);
    }
}
