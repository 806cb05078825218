use std::collections::BTreeMap;

use tracing::warn;

use sgeval_comm::{CommError, Collective, Gatherable};
use sgeval_core::types::SampleId;

/// Merged predictions in sample-id order.
#[derive(Debug, Clone, PartialEq)]
pub struct GatherReport<P> {
    pub predictions: Vec<P>,
    /// False when some ids in `0..=max_id` never reported.
    pub contiguous: bool,
    /// Smallest id in `0..=max_id` with no prediction.
    pub first_missing: Option<SampleId>,
}

/// Unions per-worker dictionaries; a later part overwrites an earlier one on the same id.
pub fn merge_parts<P>(
    parts: impl IntoIterator<Item = BTreeMap<SampleId, P>>,
) -> BTreeMap<SampleId, P> {
    let mut merged = BTreeMap::new();
    for part in parts {
        merged.extend(part);
    }
    merged
}

/// Flattens a merged dictionary into a sequence ordered by sample id.
///
/// Missing ids are not padded: every later prediction moves up one position per
/// gap, so `predictions[i]` is only the prediction for sample `i` when
/// `contiguous` is true.
pub fn into_ordered<P>(merged: BTreeMap<SampleId, P>) -> GatherReport<P> {
    let first_missing = merged
        .keys()
        .zip(0u64..)
        .find(|&(&id, position)| id != position)
        .map(|(_, position)| position);
    GatherReport {
        predictions: merged.into_values().collect(),
        contiguous: first_missing.is_none(),
        first_missing,
    }
}

/// Combines the per-worker results of a run into one id-ordered sequence.
///
/// With `sync_gather` the dictionary was already merged batch by batch on the
/// main process. Otherwise every rank takes part in one final all-gather.
/// Ranks other than the main process get `None`.
pub fn accumulate_predictions<C, P>(
    collective: &C,
    per_worker: BTreeMap<SampleId, P>,
    sync_gather: bool,
) -> Result<Option<GatherReport<P>>, CommError>
where
    C: Collective,
    P: Gatherable,
{
    let merged = if sync_gather {
        per_worker
    } else {
        let parts = collective.all_gather(per_worker)?;
        merge_parts(parts)
    };

    if !collective.is_main_process() {
        return Ok(None);
    }

    let report = into_ordered(merged);
    if !report.contiguous {
        warn!(
            target: "sgeval_inference",
            rank = collective.rank(),
            world_size = collective.world_size(),
            gathered = report.predictions.len() as u64,
            sample_id = report.first_missing,
            "number of images gathered from all workers is not a contiguous set; \
             some images might be missing from the evaluation"
        );
    }
    Ok(Some(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    use sgeval_comm::LocalCollective;

    fn dict(entries: &[(u64, &str)]) -> BTreeMap<SampleId, String> {
        entries.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn contiguous_keys_map_to_positions() {
        let merged = merge_parts(vec![dict(&[(2, "c"), (0, "a")]), dict(&[(1, "b")])]);
        let report = into_ordered(merged);
        assert!(report.contiguous);
        assert_eq!(report.first_missing, None);
        assert_eq!(report.predictions, vec!["a", "b", "c"]);
    }

    #[test]
    fn gaps_are_compacted_and_flagged() {
        let report = into_ordered(dict(&[(0, "a"), (1, "b"), (3, "d")]));
        assert!(!report.contiguous);
        assert_eq!(report.first_missing, Some(2));
        assert_eq!(report.predictions, vec!["a", "b", "d"]);
    }

    #[test]
    fn later_parts_win_on_duplicate_ids() {
        let merged = merge_parts(vec![dict(&[(0, "old")]), dict(&[(0, "new")])]);
        assert_eq!(merged.get(&0).map(String::as_str), Some("new"));
    }

    #[test]
    fn single_worker_merge_is_identity() {
        let only = dict(&[(1, "b"), (0, "a")]);
        let report = accumulate_predictions(&LocalCollective, only.clone(), false)
            .unwrap()
            .unwrap();
        assert_eq!(
            report.predictions,
            only.into_values().collect::<Vec<_>>()
        );
    }

    #[test]
    fn empty_merge_is_contiguous_and_empty() {
        let report =
            accumulate_predictions(&LocalCollective, BTreeMap::<u64, String>::new(), true)
                .unwrap()
                .unwrap();
        assert!(report.contiguous);
        assert!(report.predictions.is_empty());
    }
}
