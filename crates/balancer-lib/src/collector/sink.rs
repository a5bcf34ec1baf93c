//! Forwarding of collected samples to external metric systems

use crate::models::MetricSample;
use crate::observability::BalancerMetrics;
use anyhow::Result;
use async_trait::async_trait;

/// Destination for every tick's samples besides the local buffer
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn forward(&self, samples: &[MetricSample]) -> Result<()>;
}

/// Publishes the latest value of each series as a Prometheus gauge
#[derive(Clone, Default)]
pub struct PrometheusSink {
    metrics: BalancerMetrics,
}

impl PrometheusSink {
    pub fn new(metrics: BalancerMetrics) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl MetricsSink for PrometheusSink {
    async fn forward(&self, samples: &[MetricSample]) -> Result<()> {
        for sample in samples {
            self.metrics.set_sample(
                sample.kind.as_str(),
                sample.scope.as_str(),
                &sample.scope_id,
                &sample.node,
                sample.value,
            );
        }
        Ok(())
    }
}
