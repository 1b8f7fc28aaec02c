use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::error::SeekError;
use crate::kafka::broker::BrokerClient;
use crate::kafka::types::PartitionId;
use crate::metrics_const::{START_POSITION_CLAMPED_COUNTER, START_POSITION_SEEKS_COUNTER};
use crate::start_option::{StartFrom, StartOptionMap};

/// Where one partition was positioned at the start of an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekOutcome {
    pub partition: PartitionId,
    pub directive: StartFrom,
    pub offset: i64,
    /// The requested custom offset was outside the retained range
    pub clamped: bool,
}

/// Position every partition in `assignment` according to `options`.
///
/// Stateless: calling it again with the same inputs seeks to the same
/// offsets. The first broker failure aborts the epoch.
pub fn apply_start_positions<B: BrokerClient + ?Sized>(
    options: &StartOptionMap,
    assignment: &BTreeSet<PartitionId>,
    broker: &mut B,
) -> Result<Vec<SeekOutcome>, SeekError> {
    let mut outcomes = Vec::with_capacity(assignment.len());

    for &partition in assignment {
        let directive = options.directive_for(partition);
        let (offset, clamped) = resolve_offset(directive, partition, broker)?;

        broker
            .seek(partition, offset)
            .map_err(|e| SeekError::new(partition, "seek", e))?;

        metrics::counter!(START_POSITION_SEEKS_COUNTER, "directive" => directive.label())
            .increment(1);
        info!(
            partition = partition,
            offset = offset,
            directive = %directive,
            "Positioned partition"
        );

        outcomes.push(SeekOutcome {
            partition,
            directive,
            offset,
            clamped,
        });
    }

    Ok(outcomes)
}

fn resolve_offset<B: BrokerClient + ?Sized>(
    directive: StartFrom,
    partition: PartitionId,
    broker: &B,
) -> Result<(i64, bool), SeekError> {
    let earliest = || {
        broker
            .beginning_offset(partition)
            .map_err(|e| SeekError::new(partition, "fetch beginning offset", e))
    };
    let latest = || {
        broker
            .end_offset(partition)
            .map_err(|e| SeekError::new(partition, "fetch end offset", e))
    };

    match directive {
        StartFrom::Restart => {
            let committed = broker
                .committed(partition)
                .map_err(|e| SeekError::new(partition, "fetch committed offset", e))?;
            match committed {
                Some(offset) => Ok((offset, false)),
                None => Ok((earliest()?, false)),
            }
        }
        StartFrom::Earliest => Ok((earliest()?, false)),
        StartFrom::Latest => Ok((latest()?, false)),
        StartFrom::Custom(requested) => {
            let (low, high) = (earliest()?, latest()?);
            let offset = requested.clamp(low, high.max(low));
            let clamped = offset != requested;
            if clamped {
                warn!(
                    partition = partition,
                    requested = requested,
                    earliest = low,
                    latest = high,
                    offset = offset,
                    "Custom start offset outside retained range, clamping"
                );
                metrics::counter!(START_POSITION_CLAMPED_COUNTER).increment(1);
            }
            Ok((offset, clamped))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::test_utils::InMemoryBroker;
    use crate::kafka::types::ALL_PARTITIONS;

    fn five_partitions() -> InMemoryBroker {
        let broker = InMemoryBroker::default();
        for partition in 0..5 {
            broker.add_partition(partition, 100, 200);
        }
        broker.assign(0..5);
        broker
    }

    fn assignment() -> BTreeSet<PartitionId> {
        (0..5).collect()
    }

    #[test]
    fn test_restart_on_fresh_partitions_seeks_to_earliest() {
        let mut broker = five_partitions();

        let outcomes =
            apply_start_positions(&StartOptionMap::restart_default(), &assignment(), &mut broker)
                .unwrap();

        assert_eq!(outcomes.len(), 5);
        assert!(outcomes.iter().all(|o| o.offset == 100 && !o.clamped));
        assert_eq!(
            broker.seek_history(),
            (0..5).map(|p| (p, 100)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_restart_resumes_from_committed() {
        let mut broker = five_partitions();
        broker.set_committed(2, 150);

        let outcomes =
            apply_start_positions(&StartOptionMap::new(), &assignment(), &mut broker).unwrap();

        assert_eq!(outcomes[2].offset, 150);
        assert_eq!(outcomes[0].offset, 100);
    }

    #[test]
    fn test_latest_seeks_to_end() {
        let mut broker = five_partitions();
        broker.set_committed(1, 120);

        let outcomes = apply_start_positions(
            &StartOptionMap::all_partitions(StartFrom::Latest),
            &assignment(),
            &mut broker,
        )
        .unwrap();

        assert!(outcomes.iter().all(|o| o.offset == 200));
    }

    #[test]
    fn test_earliest_ignores_committed() {
        let mut broker = five_partitions();
        broker.set_committed(3, 180);

        let outcomes = apply_start_positions(
            &StartOptionMap::all_partitions(StartFrom::Earliest),
            &assignment(),
            &mut broker,
        )
        .unwrap();

        assert!(outcomes.iter().all(|o| o.offset == 100));
    }

    #[test]
    fn test_partial_custom_map_restarts_the_rest() {
        let mut broker = five_partitions();
        let options =
            StartOptionMap::from_entries([(1, StartFrom::Custom(110)), (3, StartFrom::Custom(130))]);

        let outcomes = apply_start_positions(&options, &assignment(), &mut broker).unwrap();

        let offsets: Vec<_> = outcomes.iter().map(|o| (o.partition, o.offset)).collect();
        assert_eq!(
            offsets,
            vec![(0, 100), (1, 110), (2, 100), (3, 130), (4, 100)]
        );
        assert_eq!(outcomes[1].directive, StartFrom::Custom(110));
        assert_eq!(outcomes[0].directive, StartFrom::Restart);
    }

    #[test]
    fn test_custom_offsets_are_clamped_to_retained_range() {
        let mut broker = five_partitions();
        let options = StartOptionMap::from_entries([
            (0, StartFrom::Custom(5)),
            (1, StartFrom::Custom(5000)),
            (2, StartFrom::Custom(200)),
            (ALL_PARTITIONS, StartFrom::Custom(150)),
        ]);

        let outcomes = apply_start_positions(&options, &assignment(), &mut broker).unwrap();

        assert_eq!((outcomes[0].offset, outcomes[0].clamped), (100, true));
        assert_eq!((outcomes[1].offset, outcomes[1].clamped), (200, true));
        assert_eq!((outcomes[2].offset, outcomes[2].clamped), (200, false));
        assert_eq!((outcomes[3].offset, outcomes[3].clamped), (150, false));
    }

    #[test]
    fn test_reapplying_is_idempotent() {
        let mut broker = five_partitions();
        let options = StartOptionMap::all_partitions(StartFrom::Custom(120));

        let first = apply_start_positions(&options, &assignment(), &mut broker).unwrap();
        let second = apply_start_positions(&options, &assignment(), &mut broker).unwrap();

        assert_eq!(first, second);
        assert_eq!(broker.current_position(4), Some(120));
    }

    #[test]
    fn test_seek_failure_names_partition() {
        let mut broker = five_partitions();
        broker.fail_seeks_for(3);

        let err = apply_start_positions(&StartOptionMap::new(), &assignment(), &mut broker)
            .unwrap_err();

        assert_eq!(err.partition, 3);
        assert_eq!(err.step, "seek");
        // Partitions before the failure were positioned, none after
        assert_eq!(broker.seek_history().len(), 3);
    }

    #[test]
    fn test_unknown_partition_fails_offset_lookup() {
        let mut broker = five_partitions();
        let assignment = BTreeSet::from([7]);

        let err = apply_start_positions(&StartOptionMap::new(), &assignment, &mut broker)
            .unwrap_err();

        assert_eq!(err.partition, 7);
        assert_eq!(err.step, "fetch committed offset");
    }

    #[test]
    fn test_empty_assignment_is_a_no_op() {
        let mut broker = five_partitions();

        let outcomes =
            apply_start_positions(&StartOptionMap::new(), &BTreeSet::new(), &mut broker).unwrap();

        assert!(outcomes.is_empty());
        assert!(broker.seek_history().is_empty());
    }
}
