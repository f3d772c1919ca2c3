//! Version oracle: read versions for snapshot-consistent fan-outs.

use lattice_cluster::{Database, TransactionError, TransactionOption, Version};

/// Fetch a read version usable for pinning parallel replica reads to one
/// snapshot. Transient faults are retried after the runtime's backoff;
/// anything else propagates.
pub(crate) async fn current_version(db: &dyn Database) -> Result<Version, TransactionError> {
    loop {
        let mut tr = db.transaction();
        tr.set_option(TransactionOption::LockAware);
        match tr.get_read_version().await {
            Ok(version) => return Ok(version),
            Err(err) => tr.on_error(err).await?,
        }
    }
}
