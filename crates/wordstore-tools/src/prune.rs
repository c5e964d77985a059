//! Threshold pruning of rare, stale and overlong tokens.

use tracing::info;
use wordstore_core::record::is_metadata_key;
use wordstore_core::{CounterRecord, Datastore, Handle, Journal, PruneThresholds, Visit};

use crate::error::ToolResult;

/// Deletes per journal commit.
const PRUNE_BATCH: usize = 1000;

/// Whether a record falls under any threshold. Counts are compared as the
/// sum of both fields so one rule serves single and combined lists.
pub fn should_prune(token: &[u8], rec: &CounterRecord, thresholds: &PruneThresholds) -> bool {
    if is_metadata_key(token) {
        return false;
    }
    let total = u64::from(rec.spam_count) + u64::from(rec.good_count);
    (thresholds.min_count > 0 && total < u64::from(thresholds.min_count))
        || (thresholds.min_date > 0 && rec.last_seen != 0 && rec.last_seen < thresholds.min_date)
        || (thresholds.max_token_len > 0 && token.len() > thresholds.max_token_len)
}

/// Delete every record of `handle` that [`should_prune`] selects.
/// Returns the number removed.
pub fn prune(
    ds: &Datastore,
    handle: &mut Handle,
    thresholds: &PruneThresholds,
) -> ToolResult<usize> {
    let mut victims: Vec<Vec<u8>> = Vec::new();
    handle.for_each(|token, rec| {
        if should_prune(token, rec, thresholds) {
            victims.push(token.to_vec());
        }
        Visit::Continue
    })?;

    for batch in victims.chunks(PRUNE_BATCH) {
        let mut journal = Journal::begin();
        for token in batch {
            journal.delete(handle, token);
        }
        journal.commit(ds, &mut [&mut *handle])?;
    }

    info!(list = %handle.list(), removed = victims.len(), "Pruned wordlist");
    Ok(victims.len())
}
