//! Summary sinks: where evaluated summary ops end up after a run.

use std::sync::{Arc, Mutex};

use crate::tensor::Tensor;

/// A single evaluated summary.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryEvent {
    /// Scoped tag, e.g. `container/summary_sum`.
    pub tag: String,
    pub value: Tensor,
}

/// Receiver for evaluated summaries.
pub trait SummarySink: Send + Sync + std::fmt::Debug {
    fn record(&self, event: SummaryEvent);
}

/// Collects summaries in memory for inspection.
#[derive(Debug, Clone, Default)]
pub struct InMemorySummarySink {
    events: Arc<Mutex<Vec<SummaryEvent>>>,
}

impl InMemorySummarySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SummaryEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Events whose tag equals `tag`.
    pub fn events_tagged(&self, tag: &str) -> Vec<SummaryEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.tag == tag)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SummarySink for InMemorySummarySink {
    fn record(&self, event: SummaryEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
