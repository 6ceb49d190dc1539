//! The outward-facing preemption coordinator.
//!
//! [`PreemptionManager`] drives one preemption cycle at a time: it filters
//! candidates, runs the dry-run selection, reconciles the outcome with the
//! mark indices, advances the grace-period state machine, and exposes the
//! ready-to-kill set. One readers-writer lock guards the measure store,
//! relationship store, kill set, and queue-usage snapshot as a single
//! transactional unit.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::measure::{measure_key, MeasureStore};
use crate::relationship::{MarkedContainer, RelationshipStore};
use crate::selection::{filter_candidates, PreemptionType, SelectionEngine};
use crate::types::{
    AttemptId, Clock, ContainerId, PreemptionConfig, Priority, QueueNode, QueuePartitionUpdate,
    QueueUsage, Resource, ResourceCalculator, ResourceName, ResourceRequirement, RunningContainer,
    SystemClock,
};

#[derive(Default)]
struct PreemptionState {
    measures: MeasureStore,
    relationships: RelationshipStore,
    // Containers chosen so far in the current cycle; cleared when a cycle
    // starts.
    selecting: HashSet<ContainerId>,
    to_kill: HashSet<ContainerId>,
    queue_usages: HashMap<String, QueueUsage>,
    dry_run_seq: u64,
}

/// The preemption decision engine.
///
/// A passive library object: callers drive cycles via [`try_preempt`] and
/// collect promoted containers via [`pull_containers_to_kill`]; the policy
/// feeds per-queue budgets via [`update_partitions`]; event handlers cancel
/// marks via the `unmark_*` operations. Every call completes synchronously
/// under the internal lock, so independent instances can be constructed
/// freely (tests inject a [`ManualClock`](crate::types::ManualClock)).
///
/// [`try_preempt`]: PreemptionManager::try_preempt
/// [`pull_containers_to_kill`]: PreemptionManager::pull_containers_to_kill
/// [`update_partitions`]: PreemptionManager::update_partitions
pub struct PreemptionManager<C: Clock = SystemClock> {
    config: PreemptionConfig,
    calculator: Box<dyn ResourceCalculator>,
    clock: C,
    state: RwLock<PreemptionState>,
}

impl PreemptionManager<SystemClock> {
    /// Creates a manager with the default configuration and system clock.
    #[must_use]
    pub fn with_defaults(calculator: Box<dyn ResourceCalculator>) -> Self {
        Self::new(PreemptionConfig::default(), calculator, SystemClock)
    }
}

impl<C: Clock> PreemptionManager<C> {
    /// Creates a manager with the given configuration, dominance rule, and
    /// clock.
    #[must_use]
    pub fn new(config: PreemptionConfig, calculator: Box<dyn ResourceCalculator>, clock: C) -> Self {
        Self {
            config,
            calculator,
            clock,
            state: RwLock::new(PreemptionState::default()),
        }
    }

    /// Returns the engine configuration.
    #[must_use]
    pub fn config(&self) -> &PreemptionConfig {
        &self.config
    }

    /// Runs one preemption cycle for a resource requirement.
    ///
    /// Candidates must be sorted in preemption order, earliest first; the
    /// order is preserved as the tie-breaker. Only different-queue
    /// candidates are considered. When selection cannot cover the
    /// requirement, nothing is marked and `false` is returned. Otherwise
    /// each selected container is marked (or, if its existing mark has been
    /// confirmed past the grace period by an equal requirement, promoted to
    /// the kill set) and `true` is returned.
    pub fn try_preempt(
        &self,
        requirement: &ResourceRequirement,
        candidates: &[RunningContainer],
        cluster: Resource,
        partition: &str,
    ) -> bool {
        let mut guard = self.state.write();
        let state = &mut *guard;
        state.selecting.clear();

        let candidates =
            filter_candidates(PreemptionType::DifferentQueue, requirement, candidates);

        state.dry_run_seq += 1;
        let token = state.dry_run_seq;
        let selected = SelectionEngine {
            calculator: self.calculator.as_ref(),
            measures: &mut state.measures,
            relationships: &state.relationships,
            queue_usages: &state.queue_usages,
            selecting: &mut state.selecting,
        }
        .select(token, &candidates, requirement.required, cluster, partition);

        let Some(selected) = selected else {
            debug!(
                partition,
                required = %requirement.required,
                "selection could not cover the requirement, nothing marked"
            );
            return false;
        };

        let now = self.clock.now_millis();
        let grace_millis = self.config.wait_before_kill_millis();
        let demanding_key = measure_key(&requirement.application.queue, partition);

        for container in &selected {
            let container_key = measure_key(&container.queue, partition);
            let prior = state
                .relationships
                .mark(&container.id)
                .map(|m| (m.start_timestamp, m.requirement == *requirement));

            match prior {
                None => {
                    let mark = MarkedContainer::new(
                        container.clone(),
                        now,
                        PreemptionType::DifferentQueue,
                        requirement.clone(),
                        container_key,
                        demanding_key.clone(),
                    );
                    state.relationships.add_mark(mark, &mut state.measures);
                }
                Some((start, false)) => {
                    // Re-targeted by a different requirement: cancel the old
                    // mark and start a new one carrying the original start
                    // timestamp, so elapsed grace is not forfeited.
                    state
                        .relationships
                        .unmark_container(&container.id, &mut state.measures);
                    let mark = MarkedContainer::new(
                        container.clone(),
                        start,
                        PreemptionType::DifferentQueue,
                        requirement.clone(),
                        container_key,
                        demanding_key.clone(),
                    );
                    state.relationships.add_mark(mark, &mut state.measures);
                }
                Some((start, true)) => {
                    if now - start > grace_millis {
                        info!(
                            container = %container.id,
                            queue = %container.queue,
                            "grace period elapsed, promoting mark to kill set"
                        );
                        state.to_kill.insert(container.id.clone());
                    }
                    state.relationships.confirm_listed(&container.id, now);
                }
            }
        }

        true
    }

    /// Takes the current kill set, leaving an empty one behind.
    ///
    /// Ownership of the returned snapshot transfers to the caller; the
    /// engine does not retain it.
    pub fn pull_containers_to_kill(&self) -> HashSet<ContainerId> {
        let mut state = self.state.write();
        std::mem::take(&mut state.to_kill)
    }

    /// Returns true if the queue-partition may reclaim `demand` from others.
    ///
    /// A debtor can never reclaim; a creditor can as long as the demand fits
    /// its remaining reclaim budget.
    #[must_use]
    pub fn can_queue_preempt(
        &self,
        cluster: Resource,
        queue: &str,
        partition: &str,
        demand: Resource,
    ) -> bool {
        let state = self.state.read();
        let Some(measure) = state.measures.get(&measure_key(queue, partition)) else {
            return false;
        };
        if measure.debtor {
            return false;
        }

        let headroom = measure.max_preemptable - measure.total_marked_preempted;
        self.calculator.fits_in(cluster, demand, headroom)
    }

    /// Returns the resource currently marked on behalf of an application
    /// attempt at a priority and resource name, zero when any level is
    /// absent.
    #[must_use]
    pub fn resources_marked_for(
        &self,
        attempt_id: &AttemptId,
        priority: Priority,
        resource_name: &ResourceName,
    ) -> Resource {
        let state = self.state.read();
        state
            .relationships
            .demanding_app(attempt_id)
            .map(|app| app.marked_resource(priority, resource_name))
            .unwrap_or_default()
    }

    /// Applies a batch of per-queue-partition policy updates.
    pub fn update_partitions(&self, updates: &[QueuePartitionUpdate]) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        for update in updates {
            state.measures.update_partition(
                &update.queue,
                &update.partition,
                update.ideal,
                update.preemptable,
                &mut state.relationships,
            );
        }
    }

    /// Cancels the mark on a container, if any.
    pub fn unmark_container(&self, id: &ContainerId) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        state.relationships.unmark_container(id, &mut state.measures);
    }

    /// Cancels every mark demanded by an application attempt, if any.
    pub fn unmark_demanding_app(&self, attempt_id: &AttemptId) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        state
            .relationships
            .unmark_demanding_app(attempt_id, &mut state.measures);
    }

    /// Rebuilds the leaf-queue usage snapshot from a refreshed queue tree.
    ///
    /// The previous snapshot is replaced wholesale.
    pub fn queue_refreshed(&self, root: &QueueNode) {
        let mut usages = HashMap::new();

        let mut pending = VecDeque::new();
        pending.push_back(root);
        while let Some(node) = pending.pop_front() {
            if node.is_leaf() {
                usages.insert(node.name.clone(), node.usage.clone());
            } else {
                pending.extend(node.children.iter());
            }
        }

        debug!(leaves = usages.len(), "rebuilt queue usage snapshot");
        self.state.write().queue_usages = usages;
    }

    /// Returns true if the container is currently marked.
    #[must_use]
    pub fn is_marked(&self, id: &ContainerId) -> bool {
        self.state.read().relationships.is_marked(id)
    }

    /// Ids of every currently marked container.
    #[must_use]
    pub fn marked_containers(&self) -> Vec<ContainerId> {
        self.state
            .read()
            .relationships
            .marks()
            .map(|m| m.container.id.clone())
            .collect()
    }

    /// Total resource currently marked against a queue-partition measure,
    /// zero if the measure does not exist.
    #[must_use]
    pub fn total_marked(&self, queue: &str, partition: &str) -> Resource {
        self.state
            .read()
            .measures
            .get(&measure_key(queue, partition))
            .map(|m| m.total_marked_preempted)
            .unwrap_or_default()
    }
}
