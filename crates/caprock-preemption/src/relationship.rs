//! Mark records and the indices linking them to demanding applications.
//!
//! The [`RelationshipStore`] owns every [`MarkedContainer`] and keeps two
//! views consistent: container-id to mark, and attempt-id to
//! [`DemandingApp`]. Every mutation also maintains the
//! `total_marked_preempted` counters of the two measures each mark points
//! back to, so additions and removals stay symmetric.

use std::collections::{HashMap, HashSet};

use crate::measure::MeasureStore;
use crate::selection::PreemptionType;
use crate::types::{
    ApplicationHandle, AttemptId, ContainerId, Priority, Resource, ResourceName,
    ResourceRequirement, RunningContainer,
};

/// A recorded intent to preempt one running container.
#[derive(Debug, Clone)]
pub struct MarkedContainer {
    /// The container under the mark.
    pub container: RunningContainer,
    /// The demand that justified the mark.
    pub requirement: ResourceRequirement,
    /// Wall time the mark first existed, in milliseconds.
    pub start_timestamp: i64,
    /// Wall time a cycle most recently confirmed the mark. `i64::MAX` means
    /// just created, to be refreshed by the current cycle.
    pub last_listed_timestamp: i64,
    /// How the mark relates demander to container.
    pub preemption_type: PreemptionType,
    /// Measure key of the container's queue-partition.
    pub container_queue_key: String,
    /// Measure key of the demanding queue-partition.
    pub demanding_queue_key: String,
}

impl MarkedContainer {
    /// Creates a mark record.
    #[must_use]
    pub fn new(
        container: RunningContainer,
        start_timestamp: i64,
        preemption_type: PreemptionType,
        requirement: ResourceRequirement,
        container_queue_key: String,
        demanding_queue_key: String,
    ) -> Self {
        Self {
            container,
            requirement,
            start_timestamp,
            last_listed_timestamp: i64::MAX,
            preemption_type,
            container_queue_key,
            demanding_queue_key,
        }
    }
}

/// One application attempt with at least one mark made on its behalf.
#[derive(Debug, Clone)]
pub struct DemandingApp {
    /// Attempt id.
    pub attempt_id: AttemptId,
    /// Handle for queue-name and user lookups.
    pub application: ApplicationHandle,
    /// Containers this demander caused to be marked.
    pub to_preempt_containers: HashSet<ContainerId>,
    /// Marked capacity aggregated per priority and resource name. The
    /// any-node bucket at each priority covers every mark; labeled buckets
    /// cover only marks demanded under that label.
    pub to_preempt_resources: HashMap<Priority, HashMap<ResourceName, Resource>>,
    // Which labeled bucket each container contributed to, so removal can
    // subtract from exactly that bucket without re-walking.
    container_buckets: HashMap<ContainerId, (Priority, ResourceName)>,
}

impl DemandingApp {
    fn new(attempt_id: AttemptId, application: ApplicationHandle) -> Self {
        Self {
            attempt_id,
            application,
            to_preempt_containers: HashSet::new(),
            to_preempt_resources: HashMap::new(),
            container_buckets: HashMap::new(),
        }
    }

    fn bucket(&mut self, priority: Priority, name: &ResourceName) -> &mut Resource {
        self.to_preempt_resources
            .entry(priority)
            .or_default()
            .entry(name.clone())
            .or_default()
    }

    fn add_container(
        &mut self,
        id: &ContainerId,
        allocated: Resource,
        priority: Priority,
        resource_name: &ResourceName,
    ) {
        self.to_preempt_containers.insert(id.clone());

        if !resource_name.is_any() {
            *self.bucket(priority, resource_name) += allocated;
            self.container_buckets
                .insert(id.clone(), (priority, resource_name.clone()));
        }

        // The any-node bucket covers every mark regardless of locality.
        *self.bucket(priority, &ResourceName::Any) += allocated;
    }

    fn remove_container(&mut self, id: &ContainerId, allocated: Resource, priority: Priority) {
        if !self.to_preempt_containers.remove(id) {
            return;
        }

        if let Some((bucket_priority, bucket_name)) = self.container_buckets.remove(id) {
            let bucket = self.bucket(bucket_priority, &bucket_name);
            *bucket -= allocated;
            debug_assert!(bucket.is_non_negative());
        }

        let any = self.bucket(priority, &ResourceName::Any);
        *any -= allocated;
        debug_assert!(any.is_non_negative());
    }

    /// Returns the aggregate marked for a priority and resource name, zero
    /// when either level is absent.
    #[must_use]
    pub fn marked_resource(&self, priority: Priority, resource_name: &ResourceName) -> Resource {
        self.to_preempt_resources
            .get(&priority)
            .and_then(|by_name| by_name.get(resource_name))
            .copied()
            .unwrap_or_default()
    }
}

/// The container-id and attempt-id indices over all marks.
#[derive(Debug, Default)]
pub struct RelationshipStore {
    marks: HashMap<ContainerId, MarkedContainer>,
    demanding_apps: HashMap<AttemptId, DemandingApp>,
}

impl RelationshipStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a mark.
    #[must_use]
    pub fn mark(&self, id: &ContainerId) -> Option<&MarkedContainer> {
        self.marks.get(id)
    }

    /// Returns true if the container is currently marked.
    #[must_use]
    pub fn is_marked(&self, id: &ContainerId) -> bool {
        self.marks.contains_key(id)
    }

    /// Iterates over all marks.
    pub fn marks(&self) -> impl Iterator<Item = &MarkedContainer> {
        self.marks.values()
    }

    /// Number of marks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.marks.len()
    }

    /// Returns true if no marks exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    /// Looks up a demanding application.
    #[must_use]
    pub fn demanding_app(&self, attempt_id: &AttemptId) -> Option<&DemandingApp> {
        self.demanding_apps.get(attempt_id)
    }

    /// Ids of marks whose demanding application sits in the given queue.
    #[must_use]
    pub fn marks_demanded_by_queue(&self, queue: &str) -> Vec<ContainerId> {
        self.marks
            .values()
            .filter(|m| m.requirement.application.queue == queue)
            .map(|m| m.container.id.clone())
            .collect()
    }

    /// Ids of marks whose container resides in the given queue.
    #[must_use]
    pub fn marks_on_queue(&self, queue: &str) -> Vec<ContainerId> {
        self.marks
            .values()
            .filter(|m| m.container.queue == queue)
            .map(|m| m.container.id.clone())
            .collect()
    }

    /// Records a confirming cycle on an existing mark.
    pub(crate) fn confirm_listed(&mut self, id: &ContainerId, now_millis: i64) {
        if let Some(mark) = self.marks.get_mut(id) {
            mark.last_listed_timestamp = now_millis;
        }
    }

    /// Inserts a mark, creating the demanding app if absent and charging
    /// the allocated resource to both back-pointed measures.
    pub fn add_mark(&mut self, mark: MarkedContainer, measures: &mut MeasureStore) {
        let id = mark.container.id.clone();
        debug_assert!(!self.marks.contains_key(&id));

        let allocated = mark.container.allocated;
        let attempt_id = mark.requirement.application.attempt_id.clone();
        let app = self
            .demanding_apps
            .entry(attempt_id.clone())
            .or_insert_with(|| DemandingApp::new(attempt_id, mark.requirement.application.clone()));
        app.add_container(
            &id,
            allocated,
            mark.requirement.priority,
            &mark.requirement.resource_name,
        );

        measures
            .get_or_create(&mark.container_queue_key)
            .total_marked_preempted += allocated;
        measures
            .get_or_create(&mark.demanding_queue_key)
            .total_marked_preempted += allocated;

        self.marks.insert(id, mark);
    }

    /// Removes a mark and undoes its bookkeeping. Unknown ids are ignored.
    pub fn unmark_container(&mut self, id: &ContainerId, measures: &mut MeasureStore) {
        let Some(mark) = self.marks.remove(id) else {
            return;
        };

        let allocated = mark.container.allocated;
        if let Some(app) = self
            .demanding_apps
            .get_mut(&mark.requirement.application.attempt_id)
        {
            app.remove_container(id, allocated, mark.requirement.priority);
        }

        Self::subtract_marked(measures, &mark.container_queue_key, allocated);
        Self::subtract_marked(measures, &mark.demanding_queue_key, allocated);
    }

    /// Removes a demanding app and every mark it owned. Unknown attempt ids
    /// are ignored; the demander's aggregates are discarded whole.
    pub fn unmark_demanding_app(&mut self, attempt_id: &AttemptId, measures: &mut MeasureStore) {
        let Some(app) = self.demanding_apps.remove(attempt_id) else {
            return;
        };

        for id in &app.to_preempt_containers {
            if let Some(mark) = self.marks.remove(id) {
                let allocated = mark.container.allocated;
                Self::subtract_marked(measures, &mark.container_queue_key, allocated);
                Self::subtract_marked(measures, &mark.demanding_queue_key, allocated);
            }
        }
    }

    fn subtract_marked(measures: &mut MeasureStore, key: &str, allocated: Resource) {
        if let Some(measure) = measures.get_mut(key) {
            measure.total_marked_preempted -= allocated;
            debug_assert!(measure.total_marked_preempted.is_non_negative());
        }
    }
}
