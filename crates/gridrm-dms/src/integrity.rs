//! Side channel for reporting damaged or missing replicas.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{DmsError, DmsResult};
use crate::types::ProblematicReplica;

/// Receives problematic replica reports.
#[async_trait]
pub trait IntegrityReporter: Send + Sync {
    /// Record one problematic replica on behalf of `source_component`.
    async fn insert_problematic(
        &self,
        source_component: &str,
        replica: &ProblematicReplica,
    ) -> DmsResult<()>;
}

/// Accepts and forgets every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullIntegrityReporter;

#[async_trait]
impl IntegrityReporter for NullIntegrityReporter {
    async fn insert_problematic(
        &self,
        _source_component: &str,
        _replica: &ProblematicReplica,
    ) -> DmsResult<()> {
        Ok(())
    }
}

/// Keeps reports in memory. Optional latency and rejection for tests.
#[derive(Debug, Default)]
pub struct MemoryIntegrityReporter {
    reports: Mutex<Vec<(String, ProblematicReplica)>>,
    delay: Mutex<Option<Duration>>,
    rejecting: AtomicBool,
}

impl MemoryIntegrityReporter {
    /// Create an empty reporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every report by `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Refuse every report.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Reports received so far as `(source_component, replica)`.
    pub fn reports(&self) -> Vec<(String, ProblematicReplica)> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl IntegrityReporter for MemoryIntegrityReporter {
    async fn insert_problematic(
        &self,
        source_component: &str,
        replica: &ProblematicReplica,
    ) -> DmsResult<()> {
        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(DmsError::Conflict {
                item: replica.lfn.clone(),
                reason: "integrity database refused the report".to_string(),
            });
        }
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((source_component.to_string(), replica.clone()));
        Ok(())
    }
}

/// Run a report under a deadline; an expired deadline becomes [`DmsError::Timeout`].
pub async fn report_with_deadline(
    reporter: &dyn IntegrityReporter,
    source_component: &str,
    replica: &ProblematicReplica,
    deadline: Duration,
) -> DmsResult<()> {
    match tokio::time::timeout(deadline, reporter.insert_problematic(source_component, replica))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(DmsError::Timeout {
            operation: "insert_problematic".to_string(),
            secs: deadline.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn replica() -> ProblematicReplica {
        ProblematicReplica {
            lfn: "/grid/vo/a".to_string(),
            pfn: "mem://CERN-DST/grid/vo/a".to_string(),
            se: "CERN-DST".to_string(),
            prognosis: "PFNMissing".to_string(),
        }
    }

    #[tokio::test]
    async fn test_report_recorded() {
        let reporter = MemoryIntegrityReporter::new();
        report_with_deadline(&reporter, "JobWrapper", &replica(), Duration::from_secs(1))
            .await
            .unwrap();
        let reports = reporter.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, "JobWrapper");
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_times_out() {
        let reporter = MemoryIntegrityReporter::new();
        reporter.set_delay(Some(Duration::from_secs(30)));
        let err = report_with_deadline(&reporter, "JobWrapper", &replica(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(reporter.reports().is_empty());
    }
}
