//! Bulk inventory producer.
//!
//! User profiles are enumerated on the calling thread; package enumeration
//! and encoding run on a dedicated worker created per call. The worker owns
//! the write end of the channel, so the channel is closed on every exit path
//! (completion, I/O error, or panic unwinding) and the daemon always sees
//! end-of-stream.

use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use companion_core::platform::PackageSource;
use companion_core::{AppInventoryRecord, InventorySink, UserId};

use crate::error::{io_err, InventoryError};
use crate::wire::encode_record;

pub const WORKER_THREAD_NAME: &str = "companion.inventory";

/// What a single transmission managed to send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransmitReport {
    pub users: usize,
    pub records: usize,
    /// Packages without application metadata.
    pub skipped: usize,
    /// Set when the stream was cut short; the records before it were sent.
    pub error: Option<String>,
}

/// Handle on an in-flight transmission.
#[derive(Debug)]
pub struct TransmitHandle {
    worker: JoinHandle<TransmitReport>,
}

impl TransmitHandle {
    /// Block until the worker has closed the channel.
    pub fn join(self) -> Result<TransmitReport, InventoryError> {
        self.worker
            .join()
            .map_err(|_| InventoryError::WorkerPanicked)
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }
}

#[derive(Clone)]
pub struct InventoryTransmitter {
    source: Arc<dyn PackageSource>,
}

impl InventoryTransmitter {
    pub fn new(source: Arc<dyn PackageSource>) -> Self {
        Self { source }
    }

    /// Stream every installed application for every user into `sink`.
    ///
    /// Returns once the worker is running; the caller never waits on the
    /// consumer. On error the sink has already been dropped (closed).
    pub fn transmit(&self, sink: InventorySink) -> Result<TransmitHandle, InventoryError> {
        let users = self.source.users()?;
        tracing::debug!(users = users.len(), "starting inventory transmission");

        let source = self.source.clone();
        let worker = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || stream_inventory(source.as_ref(), &users, sink))
            .map_err(InventoryError::Spawn)?;
        Ok(TransmitHandle { worker })
    }
}

/// Write all records for `users` into `sink`, then close it.
pub fn stream_inventory(
    source: &dyn PackageSource,
    users: &[UserId],
    sink: InventorySink,
) -> TransmitReport {
    let mut out = BufWriter::new(sink);
    let mut report = TransmitReport {
        users: users.len(),
        ..TransmitReport::default()
    };

    let outcome = write_records(source, users, &mut out, &mut report).and_then(|()| {
        out.flush()
            .map_err(|e| io_err("flushing inventory channel", e))
    });

    match outcome {
        Ok(()) => tracing::debug!(
            records = report.records,
            skipped = report.skipped,
            "inventory transmission complete"
        ),
        Err(err) => {
            tracing::warn!(
                records = report.records,
                error = %err,
                "inventory transmission cut short"
            );
            report.error = Some(err.to_string());
        }
    }

    report
}

fn write_records<W: Write>(
    source: &dyn PackageSource,
    users: &[UserId],
    out: &mut W,
    report: &mut TransmitReport,
) -> Result<(), InventoryError> {
    let mut buf = Vec::new();
    for user in users {
        let packages = match source.installed_packages(*user) {
            Ok(packages) => packages,
            Err(err) => {
                tracing::warn!(user = %user, error = %err, "skipping user with unreadable packages");
                continue;
            }
        };

        for package in &packages {
            if package.uid.is_none() {
                report.skipped += 1;
                continue;
            }
            let installer = match source.installer_of(&package.package_name) {
                Ok(installer) => installer,
                Err(err) => {
                    tracing::debug!(
                        package = %package.package_name,
                        error = %err,
                        "installer lookup failed; sending empty installer"
                    );
                    None
                }
            };
            let Some(record) = AppInventoryRecord::from_package(package, installer) else {
                continue;
            };

            buf.clear();
            encode_record(&record, &mut buf);
            out.write_all(&buf)
                .map_err(|e| io_err("writing inventory record", e))?;
            report.records += 1;
        }
    }
    Ok(())
}
