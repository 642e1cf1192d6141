//! Failure collection for fleet-wide parallel calls.

use macp_types::{AgentAddress, MacpError, MacpResult, TaskError};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Shared record of the per-agent failures of one parallel call.
///
/// Cloned into every spawned task. Failures are kept in the order they were
/// recorded, so the first entry is the first failure observed.
#[derive(Clone)]
pub struct ParallelReport {
    total: usize,
    failures: Arc<Mutex<Vec<(AgentAddress, TaskError)>>>,
}

impl ParallelReport {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            failures: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of tasks the call spawned.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn record(&self, address: AgentAddress, error: TaskError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((address, error));
    }

    pub fn failed(&self) -> usize {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_error_reported(&self) -> bool {
        self.failed() > 0
    }

    /// Addresses of the agents whose task failed, in failure order.
    pub fn failed_addresses(&self) -> Vec<AgentAddress> {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(address, _)| *address)
            .collect()
    }

    /// Log every failure and discard them.
    pub fn log_swallowed(&self, space: &str) {
        let failures = std::mem::take(&mut *self.failures.lock().unwrap_or_else(|e| e.into_inner()));
        for (address, error) in failures {
            warn!(space, address = %address, error = %error, "Parallel agent task failed");
        }
    }

    /// Turn the report into an aggregate error carrying the first failure.
    pub fn into_result(self) -> MacpResult<()> {
        let mut failures =
            std::mem::take(&mut *self.failures.lock().unwrap_or_else(|e| e.into_inner()));
        if failures.is_empty() {
            return Ok(());
        }
        let failed = failures.len();
        let (_, source) = failures.swap_remove(0);
        Err(MacpError::AggregateTaskFailure {
            failed,
            total: self.total,
            source,
        })
    }
}

impl std::fmt::Debug for ParallelReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelReport")
            .field("total", &self.total)
            .field("failed", &self.failed_addresses())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    fn addr(raw: u8) -> AgentAddress {
        AgentAddress::agent(raw).unwrap()
    }

    #[test]
    fn test_empty_report_is_ok() {
        let report = ParallelReport::new(3);
        assert!(!report.is_error_reported());
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn test_first_failure_becomes_source() {
        let report = ParallelReport::new(4);
        report.record(addr(2), "first".into());
        report.clone().record(addr(5), "second".into());

        assert_eq!(report.failed(), 2);
        assert_eq!(report.failed_addresses(), vec![addr(2), addr(5)]);

        let err = report.into_result().unwrap_err();
        match &err {
            MacpError::AggregateTaskFailure { failed, total, .. } => {
                assert_eq!(*failed, 2);
                assert_eq!(*total, 4);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.source().unwrap().to_string(), "first");
    }

    #[test]
    fn test_log_swallowed_clears() {
        let report = ParallelReport::new(1);
        report.record(addr(1), "boom".into());
        report.log_swallowed("network");
        assert_eq!(report.failed(), 0);
    }
}
