//! Accounting records for transfer and registration operations.
//!
//! Records are write-only from the engine's point of view. A sink error is
//! logged by the caller and never changes the outcome of the primary operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{DmsError, DmsResult};

/// Overall result of an accounted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalStatus {
    /// Every accounted item succeeded.
    Successful,
    /// At least one accounted item failed.
    Failed,
}

/// One accounting entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountingRecord {
    /// Operation type, e.g. `replicateAndRegister` or `removePhysicalReplica`.
    pub operation_type: String,
    /// Caller user name (`unknown` when anonymous).
    pub user: String,
    /// Protocol label.
    pub protocol: String,
    /// Site the operation ran from.
    pub source_site: String,
    /// Destination endpoint.
    pub destination: String,
    /// Number of items transferred or removed.
    pub transfer_total: u64,
    /// Number of those that succeeded.
    pub transfer_ok: u64,
    /// Bytes transferred.
    pub transfer_size: u64,
    /// Transfer wall time in seconds.
    pub transfer_time: f64,
    /// Number of items registered or unregistered.
    pub registration_total: u64,
    /// Number of those that succeeded.
    pub registration_ok: u64,
    /// Registration wall time in seconds.
    pub registration_time: f64,
    /// Overall status.
    pub final_status: FinalStatus,
    /// Start time, seconds since the Unix epoch.
    pub started_at: u64,
    /// End time, seconds since the Unix epoch.
    pub ended_at: u64,
}

impl AccountingRecord {
    /// Empty record for an operation; counters are filled in by the caller.
    pub fn new(operation_type: impl Into<String>, destination: impl Into<String>) -> Self {
        let now = unix_now();
        Self {
            operation_type: operation_type.into(),
            user: String::from("unknown"),
            protocol: String::new(),
            source_site: String::new(),
            destination: destination.into(),
            transfer_total: 0,
            transfer_ok: 0,
            transfer_size: 0,
            transfer_time: 0.0,
            registration_total: 0,
            registration_ok: 0,
            registration_time: 0.0,
            final_status: FinalStatus::Successful,
            started_at: now,
            ended_at: now,
        }
    }

    /// Stamp the end time and derive the final status from the counters.
    pub fn finish(mut self) -> Self {
        self.ended_at = unix_now();
        let transfer_failed = self.transfer_ok < self.transfer_total;
        let registration_failed = self.registration_ok < self.registration_total;
        self.final_status = if transfer_failed || registration_failed {
            FinalStatus::Failed
        } else {
            FinalStatus::Successful
        };
        self
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Observer receiving accounting records.
pub trait AccountingSink: Send + Sync {
    /// Queue a record.
    fn add_record(&self, record: AccountingRecord) -> DmsResult<()>;
    /// Flush queued records.
    fn commit(&self) -> DmsResult<()>;
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAccountingSink;

impl AccountingSink for NullAccountingSink {
    fn add_record(&self, _record: AccountingRecord) -> DmsResult<()> {
        Ok(())
    }

    fn commit(&self) -> DmsResult<()> {
        Ok(())
    }
}

/// Emits every record as an `info` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAccountingSink;

impl AccountingSink for TracingAccountingSink {
    fn add_record(&self, record: AccountingRecord) -> DmsResult<()> {
        info!(
            operation = %record.operation_type,
            user = %record.user,
            destination = %record.destination,
            transfer_ok = record.transfer_ok,
            transfer_total = record.transfer_total,
            registration_ok = record.registration_ok,
            registration_total = record.registration_total,
            status = ?record.final_status,
            "accounting record"
        );
        Ok(())
    }

    fn commit(&self) -> DmsResult<()> {
        Ok(())
    }
}

/// Keeps committed records in memory. Can be told to fail to exercise error paths.
#[derive(Debug, Default)]
pub struct MemoryAccountingSink {
    pending: Mutex<Vec<AccountingRecord>>,
    committed: Mutex<Vec<AccountingRecord>>,
    failing: AtomicBool,
}

impl MemoryAccountingSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Committed records, oldest first.
    pub fn records(&self) -> Vec<AccountingRecord> {
        self.committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Committed records of one operation type.
    pub fn records_for(&self, operation_type: &str) -> Vec<AccountingRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.operation_type == operation_type)
            .collect()
    }

    fn check(&self) -> DmsResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DmsError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "accounting service unreachable",
            )));
        }
        Ok(())
    }
}

impl AccountingSink for MemoryAccountingSink {
    fn add_record(&self, record: AccountingRecord) -> DmsResult<()> {
        self.check()?;
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(())
    }

    fn commit(&self) -> DmsResult<()> {
        self.check()?;
        let drained: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        self.committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(drained);
        Ok(())
    }
}
