//! Prometheus metrics for the reconcile loops

use std::sync::Arc;

use anyhow::Result;
use prometheus::{CounterVec, Encoder, Opts, Registry, TextEncoder};

/// Outcome label values
pub const SUCCESS: &str = "success";
pub const ERROR: &str = "error";

/// Counters shared by every controller in the process
pub struct ReconcileMetrics {
    /// Reconciliations by controller and result
    pub reconciliations_total: CounterVec,
    pub registry: Arc<Registry>,
}

impl ReconcileMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let reconciliations_total = CounterVec::new(
            Opts::new("mcs_reconciliations_total", "Total reconcile passes"),
            &["controller", "result"],
        )?;
        registry.register(Box::new(reconciliations_total.clone()))?;

        Ok(Self {
            reconciliations_total,
            registry,
        })
    }

    pub fn record(&self, controller: &str, result: &str) {
        self.reconciliations_total
            .with_label_values(&[controller, result])
            .inc();
    }

    /// Render every registered metric in the Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_are_rendered_per_controller_and_result() {
        let metrics = ReconcileMetrics::new().unwrap();
        metrics.record("export", SUCCESS);
        metrics.record("export", SUCCESS);
        metrics.record("import", ERROR);

        let text = metrics.gather().unwrap();
        assert!(text.contains(r#"mcs_reconciliations_total{controller="export",result="success"} 2"#));
        assert!(text.contains(r#"mcs_reconciliations_total{controller="import",result="error"} 1"#));
    }
}
