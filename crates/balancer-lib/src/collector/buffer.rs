//! Bounded in-memory sample buffer
//!
//! Ring buffer of the most recent telemetry samples with FIFO eviction.
//! Readers always receive copies so the collector keeps sole ownership.

use crate::models::{MetricKind, MetricSample};
use std::collections::VecDeque;

/// Default number of samples retained
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

/// Ring buffer of metric samples, oldest evicted first
#[derive(Debug)]
pub struct MetricsBuffer {
    buffer: VecDeque<MetricSample>,
    capacity: usize,
}

impl Default for MetricsBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

impl MetricsBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: VecDeque::with_capacity(capacity.min(10_000)),
            capacity,
        }
    }

    pub fn push(&mut self, sample: MetricSample) {
        while self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(sample);
    }

    pub fn push_batch(&mut self, samples: impl IntoIterator<Item = MetricSample>) {
        for sample in samples {
            self.push(sample);
        }
    }

    /// The newest `count` samples (all when `None`), oldest first
    pub fn recent(&self, count: Option<usize>) -> Vec<MetricSample> {
        let count = count.unwrap_or(self.buffer.len()).min(self.buffer.len());
        self.buffer
            .iter()
            .skip(self.buffer.len() - count)
            .cloned()
            .collect()
    }

    /// Values of one metric for one scope, oldest first
    pub fn series(&self, scope_id: &str, kind: MetricKind) -> Vec<f64> {
        self.buffer
            .iter()
            .filter(|s| s.scope_id == scope_id && s.kind == kind)
            .map(|s| s.value)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
