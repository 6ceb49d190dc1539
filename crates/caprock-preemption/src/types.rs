//! Support types for the preemption engine.
//!
//! This module provides the boundary types the engine consumes and produces:
//! - [`Resource`]: a componentwise vector of countable resource dimensions
//! - [`ResourceCalculator`]: the pluggable dominance rule behind `fits_in`
//! - [`Clock`]: the pluggable wall-clock source for grace-period timing
//! - [`RunningContainer`] / [`ApplicationHandle`]: scheduler capability sets
//! - [`ResourceRequirement`]: the demand that justifies a preemption mark
//! - [`QueuePartitionUpdate`]: the periodic policy input per queue-partition
//! - [`QueueNode`] / [`QueueUsage`]: the queue-tree usage snapshot
//! - [`PreemptionConfig`]: engine configuration

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PreemptionError, Result};

/// A vector of countable resource dimensions.
///
/// All arithmetic is componentwise. Components are signed so that budget
/// negation and headroom subtraction (`used - ideal`) are representable;
/// committed totals are kept non-negative by the symmetric add/subtract
/// discipline of the relationship store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
pub struct Resource {
    /// Memory, in megabytes.
    pub memory: i64,
    /// Virtual cores.
    pub vcores: i64,
}

impl Resource {
    /// Creates a new resource vector.
    #[must_use]
    pub const fn new(memory: i64, vcores: i64) -> Self {
        Self { memory, vcores }
    }

    /// The zero resource vector.
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0, 0)
    }

    /// Returns true if every component is zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.memory == 0 && self.vcores == 0
    }

    /// Returns true if any component is strictly positive.
    #[must_use]
    pub const fn has_positive_component(&self) -> bool {
        self.memory > 0 || self.vcores > 0
    }

    /// Returns true if no component is negative.
    #[must_use]
    pub const fn is_non_negative(&self) -> bool {
        self.memory >= 0 && self.vcores >= 0
    }
}

impl std::ops::Add for Resource {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.memory + rhs.memory, self.vcores + rhs.vcores)
    }
}

impl std::ops::AddAssign for Resource {
    fn add_assign(&mut self, rhs: Self) {
        self.memory += rhs.memory;
        self.vcores += rhs.vcores;
    }
}

impl std::ops::Sub for Resource {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.memory - rhs.memory, self.vcores - rhs.vcores)
    }
}

impl std::ops::SubAssign for Resource {
    fn sub_assign(&mut self, rhs: Self) {
        self.memory -= rhs.memory;
        self.vcores -= rhs.vcores;
    }
}

impl std::ops::Neg for Resource {
    type Output = Self;

    fn neg(self) -> Self {
        Self::new(-self.memory, -self.vcores)
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<memory {}, vcores {}>", self.memory, self.vcores)
    }
}

/// The dominance rule deciding whether one resource amount fits in another.
///
/// The cluster capacity parameterizes implementations that compare dominant
/// shares rather than raw components.
pub trait ResourceCalculator: Send + Sync {
    /// Returns true if `candidate` does not exceed `capacity` under this
    /// calculator's dominance rule.
    fn fits_in(&self, cluster: Resource, candidate: Resource, capacity: Resource) -> bool;
}

/// Calculator requiring every dimension of the candidate to fit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComponentwiseCalculator;

impl ResourceCalculator for ComponentwiseCalculator {
    fn fits_in(&self, _cluster: Resource, candidate: Resource, capacity: Resource) -> bool {
        candidate.memory <= capacity.memory && candidate.vcores <= capacity.vcores
    }
}

/// Calculator considering memory only; vcores never constrain a fit.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryCalculator;

impl ResourceCalculator for MemoryCalculator {
    fn fits_in(&self, _cluster: Resource, candidate: Resource, capacity: Resource) -> bool {
        candidate.memory <= capacity.memory
    }
}

/// Wall-clock source for grace-period timing.
///
/// Replaceable so tests can drive the grace-period state machine without
/// sleeping.
pub trait Clock: Send + Sync {
    /// Current wall time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// A manually driven clock for tests.
///
/// Clones share the same underlying instant, so a test can keep a handle
/// and advance time after handing the clock to the engine.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicI64>,
}

impl ManualClock {
    /// Creates a manual clock starting at the given instant.
    #[must_use]
    pub fn new(start_millis: i64) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(start_millis)),
        }
    }

    /// Advances the clock by the given duration.
    pub fn advance(&self, duration: Duration) {
        let delta = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute instant.
    pub fn set_millis(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Stable identifier of a running container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a container id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a new random container id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier of a scheduler application attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId(String);

impl AttemptId {
    /// Creates an attempt id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a new random attempt id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling priority of a resource requirement.
///
/// An opaque key for aggregation; the engine imposes no ordering semantics.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Priority(u32);

impl Priority {
    /// Creates a priority.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the numeric priority value.
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Locality scope of a resource requirement.
///
/// `Any` matches any node; a label names a specific node or rack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceName {
    /// Any node in the partition.
    Any,
    /// A specific node or rack label.
    Label(String),
}

impl ResourceName {
    /// Creates a labeled resource name.
    ///
    /// # Errors
    ///
    /// Returns an error if the label is empty or the `*` wildcard, which is
    /// reserved for [`ResourceName::Any`].
    pub fn label(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(PreemptionError::InvalidResourceName {
                reason: "label is empty".into(),
            });
        }
        if name == "*" {
            return Err(PreemptionError::InvalidResourceName {
                reason: "label `*` is reserved for the any-node wildcard".into(),
            });
        }
        Ok(Self::Label(name))
    }

    /// Returns true if this is the any-node wildcard.
    #[must_use]
    pub const fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }
}

impl std::fmt::Display for ResourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "*"),
            Self::Label(name) => write!(f, "{name}"),
        }
    }
}

/// Capability set of a scheduler application attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationHandle {
    /// Attempt id, the key into the demanding-app index.
    pub attempt_id: AttemptId,
    /// Leaf queue the application is submitted to.
    pub queue: String,
    /// Submitting user.
    pub user: String,
}

impl ApplicationHandle {
    /// Creates an application handle.
    #[must_use]
    pub fn new(attempt_id: AttemptId, queue: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            attempt_id,
            queue: queue.into(),
            user: user.into(),
        }
    }
}

/// Capability set of a running container presented as a preemption candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningContainer {
    /// Stable container id.
    pub id: ContainerId,
    /// Leaf queue the container is charged to.
    pub queue: String,
    /// Owning user.
    pub user: String,
    /// Resource currently allocated to the container.
    pub allocated: Resource,
    /// Whether this is the application-master container. AM containers are
    /// never preempted.
    pub is_app_master: bool,
}

impl RunningContainer {
    /// Creates a running-container handle.
    #[must_use]
    pub fn new(
        id: ContainerId,
        queue: impl Into<String>,
        user: impl Into<String>,
        allocated: Resource,
    ) -> Self {
        Self {
            id,
            queue: queue.into(),
            user: user.into(),
            allocated,
            is_app_master: false,
        }
    }

    /// Marks this container as the application master.
    #[must_use]
    pub fn app_master(mut self) -> Self {
        self.is_app_master = true;
        self
    }
}

/// The demand that justifies marking containers for preemption.
///
/// Two requirements are equal iff all four fields are equal; the grace-period
/// state machine keys on that equality to distinguish confirmation from
/// re-targeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    /// The demanding application.
    pub application: ApplicationHandle,
    /// Priority of the demand.
    pub priority: Priority,
    /// Locality scope of the demand.
    pub resource_name: ResourceName,
    /// Resource amount demanded.
    pub required: Resource,
}

impl ResourceRequirement {
    /// Creates a resource requirement.
    #[must_use]
    pub fn new(
        application: ApplicationHandle,
        priority: Priority,
        resource_name: ResourceName,
        required: Resource,
    ) -> Self {
        Self {
            application,
            priority,
            resource_name,
            required,
        }
    }
}

/// Per-(queue, partition) policy input for one preemption cycle.
///
/// Sign convention on `preemptable`: any strictly positive component means
/// the queue-partition is a debtor owing that amount; otherwise the negation
/// is the amount the queue-partition may reclaim from others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePartitionUpdate {
    /// Leaf queue name.
    pub queue: String,
    /// Node partition label.
    pub partition: String,
    /// Target allocation under the current fair-share policy.
    pub ideal: Resource,
    /// Preemption budget; see the sign convention above.
    pub preemptable: Resource,
}

impl QueuePartitionUpdate {
    /// Creates a queue-partition update.
    #[must_use]
    pub fn new(
        queue: impl Into<String>,
        partition: impl Into<String>,
        ideal: Resource,
        preemptable: Resource,
    ) -> Self {
        Self {
            queue: queue.into(),
            partition: partition.into(),
            ideal,
            preemptable,
        }
    }
}

/// Per-partition resource usage of one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueUsage {
    used: HashMap<String, Resource>,
}

impl QueueUsage {
    /// Creates an empty usage record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the used amount for a partition, zero if never recorded.
    #[must_use]
    pub fn used(&self, partition: &str) -> Resource {
        self.used.get(partition).copied().unwrap_or_default()
    }

    /// Sets the used amount for a partition.
    pub fn set_used(&mut self, partition: impl Into<String>, used: Resource) {
        self.used.insert(partition.into(), used);
    }
}

/// One node of the queue-tree snapshot handed to `queue_refreshed`.
///
/// Only leaf nodes carry authoritative usage; inner nodes exist to be walked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueNode {
    /// Queue name.
    pub name: String,
    /// Resource usage of this queue.
    pub usage: QueueUsage,
    /// Child queues; empty for a leaf.
    pub children: Vec<QueueNode>,
}

impl QueueNode {
    /// Creates a queue node with no usage and no children.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            usage: QueueUsage::new(),
            children: Vec::new(),
        }
    }

    /// Records used resource for a partition on this queue.
    #[must_use]
    pub fn with_used(mut self, partition: impl Into<String>, used: Resource) -> Self {
        self.usage.set_used(partition, used);
        self
    }

    /// Appends a child queue.
    #[must_use]
    pub fn with_child(mut self, child: QueueNode) -> Self {
        self.children.push(child);
        self
    }

    /// Returns true if this queue has no children.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Configuration for the preemption engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreemptionConfig {
    /// Grace period between first marking a container and promoting it to
    /// the kill set.
    pub wait_before_kill: Duration,
}

impl Default for PreemptionConfig {
    fn default() -> Self {
        Self {
            wait_before_kill: Duration::from_secs(30),
        }
    }
}

impl PreemptionConfig {
    /// Creates a config with the given grace period.
    ///
    /// # Errors
    ///
    /// Returns an error if the grace period is zero: a zero window would
    /// promote every mark to a kill on its first confirmation, defeating the
    /// hold-off.
    pub fn new(wait_before_kill: Duration) -> Result<Self> {
        if wait_before_kill.is_zero() {
            return Err(PreemptionError::InvalidConfig {
                reason: "grace period must be non-zero".into(),
            });
        }
        Ok(Self { wait_before_kill })
    }

    /// Grace period in whole milliseconds.
    #[must_use]
    pub fn wait_before_kill_millis(&self) -> i64 {
        i64::try_from(self.wait_before_kill.as_millis()).unwrap_or(i64::MAX)
    }
}
