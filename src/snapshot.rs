//! Snapshot persistence for partition state.
//!
//! A snapshot holds every table of a partition (full revision chains
//! included) and its index entries, stored at
//! `<base_dir>/partitions/<name>/snapshot.json`. Writes are atomic.

use std::io;

use crate::partition::{PartitionState, PartitionStore};
use crate::storage::{StoreLayout, read_json, write_json_atomic};

/// Persist the current state of `store`.
///
/// Holds the partition's read lock while serializing, so the snapshot is a
/// consistent cut.
///
/// # Errors
///
/// Returns `io::Error` if the file cannot be written.
pub(crate) async fn save_partition(layout: &StoreLayout, store: &PartitionStore) -> io::Result<()> {
    let path = layout.partition_snapshot(store.name().as_str());
    let state = store.read().await;
    write_json_atomic(&path, &*state)?;
    tracing::debug!(partition = %store.name(), path = %path.display(), "snapshot saved");
    Ok(())
}

/// Load the snapshot of partition `name`.
///
/// # Returns
///
/// The stored state, or an empty state if there is no snapshot or it is
/// corrupt. A corrupt snapshot is logged and ignored.
///
/// # Errors
///
/// Returns `io::Error` only for unexpected I/O failures.
pub(crate) fn load_partition(layout: &StoreLayout, name: &str) -> io::Result<PartitionState> {
    let path = layout.partition_snapshot(name);
    match read_json::<PartitionState>(&path)? {
        Some(state) => {
            tracing::debug!(partition = name, events = state.events.iter().count(), "snapshot loaded");
            Ok(state)
        }
        None => Ok(PartitionState::default()),
    }
}
