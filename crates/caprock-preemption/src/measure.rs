//! Per-(queue, partition) preemption bookkeeping.
//!
//! The [`MeasureStore`] is the authoritative table distinguishing *debtors*
//! (queue-partitions that must give up resources) from *creditors*
//! (queue-partitions that may reclaim them). Entries are created lazily on
//! first reference and live for the lifetime of the engine.

use std::collections::HashMap;

use tracing::debug;

use crate::relationship::RelationshipStore;
use crate::types::Resource;

/// Builds the measure key for a queue-partition pair.
#[must_use]
pub fn measure_key(queue: &str, partition: &str) -> String {
    format!("{queue}_{partition}")
}

/// Preemption measure of one entity, keyed by `<queue>_<partition>`.
///
/// A user- or application-scoped entity would use the same shape once
/// intra-queue preemption is wired up; only queue-partition entities exist
/// today.
#[derive(Debug, Clone)]
pub struct EntityMeasure {
    /// The `<queue>_<partition>` key.
    pub key: String,
    /// Target allocation under the current fair-share policy.
    pub ideal: Resource,
    /// When `debtor`, the amount that must be taken from this entity;
    /// otherwise the amount this entity may take from others.
    pub max_preemptable: Resource,
    /// Running sum of resources currently marked on containers of this
    /// queue-partition or attributable to it as a demander.
    pub total_marked_preempted: Resource,
    /// Whether someone should preempt resource from this entity.
    pub debtor: bool,
    dry_run_total: Resource,
    dry_run_token: u64,
}

impl EntityMeasure {
    fn new(key: String) -> Self {
        Self {
            key,
            ideal: Resource::zero(),
            max_preemptable: Resource::zero(),
            total_marked_preempted: Resource::zero(),
            debtor: false,
            dry_run_total: Resource::zero(),
            dry_run_token: 0,
        }
    }

    /// Returns the dry-run view of `total_marked_preempted` for one cycle.
    ///
    /// The committed total is cloned the first time a cycle token is seen;
    /// later calls with the same token return the clone, so hypothetical
    /// admissions within the cycle accumulate without touching committed
    /// state. Tokens are never reused and never zero.
    pub fn marked_for_dry_run(&mut self, token: u64) -> &mut Resource {
        if self.dry_run_token != token {
            self.dry_run_total = self.total_marked_preempted;
            self.dry_run_token = token;
        }
        &mut self.dry_run_total
    }
}

/// The authoritative table of [`EntityMeasure`]s.
#[derive(Debug, Default)]
pub struct MeasureStore {
    map: HashMap<String, EntityMeasure>,
}

impl MeasureStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a measure.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&EntityMeasure> {
        self.map.get(key)
    }

    /// Looks up a measure mutably.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut EntityMeasure> {
        self.map.get_mut(key)
    }

    /// Looks up a measure, creating an empty non-debtor entry if absent.
    pub fn get_or_create(&mut self, key: &str) -> &mut EntityMeasure {
        self.map
            .entry(key.to_string())
            .or_insert_with(|| EntityMeasure::new(key.to_string()))
    }

    /// Iterates over all measures.
    pub fn iter(&self) -> impl Iterator<Item = &EntityMeasure> {
        self.map.values()
    }

    /// Applies one policy update to a queue-partition measure.
    ///
    /// A strictly positive component in `max_preempt` makes the entity a
    /// debtor; on the non-debtor to debtor transition, every existing mark
    /// demanded by an application in this queue is cancelled (a debtor
    /// cannot simultaneously claim resources from others). A non-positive
    /// budget makes the entity a creditor and cancels every mark on
    /// containers of this queue (the reason to preempt from it has
    /// vanished); the budget is stored negated.
    ///
    /// Cancellations run through the relationship store so the backward
    /// counters stay consistent.
    pub fn update_partition(
        &mut self,
        queue: &str,
        partition: &str,
        ideal: Resource,
        max_preempt: Resource,
        relationships: &mut RelationshipStore,
    ) {
        let key = measure_key(queue, partition);
        self.get_or_create(&key).ideal = ideal;
        let was_debtor = self.map.get(&key).is_some_and(|m| m.debtor);

        if max_preempt.has_positive_component() {
            if !was_debtor {
                let stale = relationships.marks_demanded_by_queue(queue);
                if !stale.is_empty() {
                    debug!(
                        queue,
                        partition,
                        unmarked = stale.len(),
                        "queue became debtor, cancelling marks it demanded"
                    );
                }
                for id in stale {
                    relationships.unmark_container(&id, self);
                }
            }

            let measure = self.get_or_create(&key);
            measure.max_preemptable = max_preempt;
            measure.debtor = true;
        } else {
            let stale = relationships.marks_on_queue(queue);
            if !stale.is_empty() {
                debug!(
                    queue,
                    partition,
                    unmarked = stale.len(),
                    "queue is no longer a debtor, cancelling marks on it"
                );
            }
            for id in stale {
                relationships.unmark_container(&id, self);
            }

            let measure = self.get_or_create(&key);
            measure.max_preemptable = -max_preempt;
            measure.debtor = false;
        }
    }
}
