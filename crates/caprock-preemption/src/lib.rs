//! Preemption decision engine for the Caprock capacity scheduler.
//!
//! `caprock-preemption` is the core that decides *which running containers
//! to reclaim* when one queue's demand exceeds its capacity share while
//! another queue over-consumes. The policy that computes per-queue budgets,
//! the ordering of candidates, and the transport that delivers kill signals
//! all live outside; this crate keeps the books and makes the call.
//!
//! # Features
//!
//! - **Debtor/creditor bookkeeping**: per-(queue, partition) measures track
//!   ideal shares, preemption budgets, and currently marked totals
//! - **Dry-run selection**: candidates are admitted against hypothetical
//!   totals, so an unsatisfiable cycle leaves no trace
//! - **Relationship tracking**: every mark is linked to the demanding
//!   application that caused it, so cancellations cascade correctly
//! - **Grace periods**: marks promote to a kill set only after a
//!   configurable hold-off, confirmed by a later cycle
//! - **Injectable clock and dominance rule**: deterministic tests, pluggable
//!   resource comparison
//!
//! # Example
//!
//! ```rust
//! use caprock_preemption::{
//!     ApplicationHandle, AttemptId, ComponentwiseCalculator, ContainerId, PreemptionManager,
//!     Priority, QueueNode, QueuePartitionUpdate, Resource, ResourceName, ResourceRequirement,
//!     RunningContainer,
//! };
//!
//! let manager = PreemptionManager::with_defaults(Box::new(ComponentwiseCalculator));
//!
//! // The fair-share policy reports `batch` as over its share on `prod`.
//! manager.update_partitions(&[
//!     QueuePartitionUpdate::new("batch", "prod", Resource::new(4, 4), Resource::new(2, 2)),
//!     QueuePartitionUpdate::new("web", "prod", Resource::new(4, 4), Resource::new(-2, -2)),
//! ]);
//! manager.queue_refreshed(
//!     &QueueNode::new("root")
//!         .with_child(QueueNode::new("batch").with_used("prod", Resource::new(6, 6)))
//!         .with_child(QueueNode::new("web").with_used("prod", Resource::new(2, 2))),
//! );
//!
//! // An application in `web` demands resources held by `batch`.
//! let requirement = ResourceRequirement::new(
//!     ApplicationHandle::new(AttemptId::new("attempt-1"), "web", "alice"),
//!     Priority::new(1),
//!     ResourceName::Any,
//!     Resource::new(2, 2),
//! );
//! let candidates = vec![
//!     RunningContainer::new(ContainerId::new("c-1"), "batch", "bob", Resource::new(1, 1)),
//!     RunningContainer::new(ContainerId::new("c-2"), "batch", "bob", Resource::new(1, 1)),
//! ];
//!
//! assert!(manager.try_preempt(&requirement, &candidates, Resource::new(8, 8), "prod"));
//! assert!(manager.is_marked(&ContainerId::new("c-1")));
//!
//! // Marks wait out the grace period before they become killable.
//! assert!(manager.pull_containers_to_kill().is_empty());
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │              PreemptionManager                 │
//! │  ┌──────────────────────────────────────────┐  │
//! │  │            SelectionEngine               │  │
//! │  │   (dry-run admission per candidate)      │  │
//! │  └───────────┬────────────────┬─────────────┘  │
//! │  ┌───────────┴─────┐  ┌───────┴─────────────┐  │
//! │  │  MeasureStore   │  │  RelationshipStore  │  │
//! │  │ debtor budgets, │  │ marks, demanding    │  │
//! │  │ marked totals   │  │ apps, aggregates    │  │
//! │  └─────────────────┘  └─────────────────────┘  │
//! │            kill set · usage snapshot           │
//! └────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]

pub mod error;
pub mod manager;
pub mod measure;
pub mod relationship;
pub mod selection;
pub mod types;

// Re-export main types
pub use error::{PreemptionError, Result};
pub use manager::PreemptionManager;
pub use measure::{measure_key, EntityMeasure, MeasureStore};
pub use relationship::{DemandingApp, MarkedContainer, RelationshipStore};
pub use selection::{classify, PreemptionType};
pub use types::{
    ApplicationHandle, AttemptId, Clock, ComponentwiseCalculator, ContainerId, ManualClock,
    MemoryCalculator, PreemptionConfig, Priority, QueueNode, QueuePartitionUpdate, QueueUsage,
    Resource, ResourceCalculator, ResourceName, ResourceRequirement, RunningContainer, SystemClock,
};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::error::{PreemptionError, Result};
    pub use crate::manager::PreemptionManager;
    pub use crate::selection::PreemptionType;
    pub use crate::types::{
        ApplicationHandle, AttemptId, Clock, ComponentwiseCalculator, ContainerId, ManualClock,
        PreemptionConfig, Priority, QueueNode, QueuePartitionUpdate, Resource, ResourceCalculator,
        ResourceName, ResourceRequirement, RunningContainer, SystemClock,
    };
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use std::time::Duration;

    const CLUSTER: Resource = Resource::new(64, 64);

    fn res(memory: i64, vcores: i64) -> Resource {
        Resource::new(memory, vcores)
    }

    fn container(id: &str, queue: &str, allocated: Resource) -> RunningContainer {
        RunningContainer::new(ContainerId::new(id), queue, "bob", allocated)
    }

    fn requirement_from(
        attempt: &str,
        queue: &str,
        priority: u32,
        required: Resource,
    ) -> ResourceRequirement {
        ResourceRequirement::new(
            ApplicationHandle::new(AttemptId::new(attempt), queue, "alice"),
            Priority::new(priority),
            ResourceName::Any,
            required,
        )
    }

    fn manager() -> (PreemptionManager<ManualClock>, ManualClock) {
        let clock = ManualClock::default();
        let manager = PreemptionManager::new(
            PreemptionConfig::default(),
            Box::new(ComponentwiseCalculator),
            clock.clone(),
        );
        (manager, clock)
    }

    #[test]
    fn reclaim_marks_then_promotes_after_grace() {
        let (manager, clock) = manager();
        manager.update_partitions(&[
            QueuePartitionUpdate::new("alpha", "prod", res(4, 4), Resource::zero()),
            QueuePartitionUpdate::new("beta", "prod", res(4, 4), res(2, 2)),
        ]);
        manager.queue_refreshed(
            &QueueNode::new("root")
                .with_child(QueueNode::new("alpha").with_used("prod", res(2, 2)))
                .with_child(QueueNode::new("beta").with_used("prod", res(6, 6))),
        );

        let c1 = container("c-1", "beta", res(1, 1));
        let c2 = container("c-2", "beta", res(1, 1));
        let req = requirement_from("attempt-1", "alpha", 1, res(2, 2));

        assert!(manager.try_preempt(&req, &[c1.clone(), c2.clone()], CLUSTER, "prod"));
        assert_eq!(manager.marked_containers().len(), 2);
        assert_eq!(manager.total_marked("beta", "prod"), res(2, 2));
        assert_eq!(manager.total_marked("alpha", "prod"), res(2, 2));
        assert!(manager.pull_containers_to_kill().is_empty());

        clock.advance(Duration::from_secs(31));
        assert!(manager.try_preempt(&req, &[c1.clone(), c2.clone()], CLUSTER, "prod"));

        let to_kill = manager.pull_containers_to_kill();
        assert_eq!(to_kill.len(), 2);
        assert!(to_kill.contains(&c1.id));
        assert!(to_kill.contains(&c2.id));
        assert!(manager.pull_containers_to_kill().is_empty());
    }

    #[test]
    fn oversized_container_admitted_when_nothing_is_marked() {
        let (manager, _clock) = manager();
        manager.update_partitions(&[QueuePartitionUpdate::new(
            "beta",
            "prod",
            res(4, 4),
            res(1, 1),
        )]);
        manager.queue_refreshed(
            &QueueNode::new("root")
                .with_child(QueueNode::new("beta").with_used("prod", res(8, 8))),
        );

        // The only reclaimable unit individually exceeds the <1, 1> budget.
        let req = requirement_from("attempt-1", "alpha", 1, res(1, 1));
        let big = container("c-1", "beta", res(4, 4));

        assert!(manager.try_preempt(&req, &[big], CLUSTER, "prod"));
        assert!(manager.is_marked(&ContainerId::new("c-1")));
        assert_eq!(manager.total_marked("beta", "prod"), res(4, 4));
    }

    #[test]
    fn losing_debtor_status_clears_dependent_marks() {
        let (manager, _clock) = manager();
        manager.update_partitions(&[
            QueuePartitionUpdate::new("alpha", "prod", res(4, 4), Resource::zero()),
            QueuePartitionUpdate::new("beta", "prod", res(4, 4), res(2, 2)),
        ]);
        manager.queue_refreshed(
            &QueueNode::new("root")
                .with_child(QueueNode::new("alpha").with_used("prod", res(2, 2)))
                .with_child(QueueNode::new("beta").with_used("prod", res(6, 6))),
        );

        let req = requirement_from("attempt-1", "alpha", 1, res(2, 2));
        let candidates = vec![
            container("c-1", "beta", res(1, 1)),
            container("c-2", "beta", res(1, 1)),
        ];
        assert!(manager.try_preempt(&req, &candidates, CLUSTER, "prod"));
        assert_eq!(manager.marked_containers().len(), 2);

        // The policy stops treating beta as a debtor.
        manager.update_partitions(&[QueuePartitionUpdate::new(
            "beta",
            "prod",
            res(4, 4),
            Resource::zero(),
        )]);

        assert!(manager.marked_containers().is_empty());
        assert_eq!(manager.total_marked("beta", "prod"), Resource::zero());
        assert_eq!(manager.total_marked("alpha", "prod"), Resource::zero());
        assert_eq!(
            manager.resources_marked_for(
                &AttemptId::new("attempt-1"),
                Priority::new(1),
                &ResourceName::Any
            ),
            Resource::zero()
        );
    }

    #[test]
    fn requirement_change_preserves_elapsed_grace() {
        let (manager, clock) = manager();
        manager.update_partitions(&[QueuePartitionUpdate::new(
            "beta",
            "prod",
            res(4, 4),
            res(2, 2),
        )]);
        manager.queue_refreshed(
            &QueueNode::new("root")
                .with_child(QueueNode::new("beta").with_used("prod", res(6, 6))),
        );

        let c = container("c-1", "beta", res(1, 1));
        let req_low = requirement_from("attempt-1", "alpha", 1, res(1, 1));
        assert!(manager.try_preempt(&req_low, &[c.clone()], CLUSTER, "prod"));

        // Twenty seconds in, the demand shifts to another priority. The
        // container is re-marked without restarting its grace clock.
        clock.advance(Duration::from_secs(20));
        let req_high = requirement_from("attempt-1", "alpha", 2, res(1, 1));
        assert!(manager.try_preempt(&req_high, &[c.clone()], CLUSTER, "prod"));
        assert!(manager.pull_containers_to_kill().is_empty());
        assert_eq!(
            manager.resources_marked_for(
                &AttemptId::new("attempt-1"),
                Priority::new(1),
                &ResourceName::Any
            ),
            Resource::zero()
        );
        assert_eq!(
            manager.resources_marked_for(
                &AttemptId::new("attempt-1"),
                Priority::new(2),
                &ResourceName::Any
            ),
            res(1, 1)
        );

        // Eleven more seconds puts the original mark past the 30 s grace.
        clock.advance(Duration::from_secs(11));
        assert!(manager.try_preempt(&req_high, &[c.clone()], CLUSTER, "prod"));
        assert!(manager.pull_containers_to_kill().contains(&c.id));
    }

    #[test]
    fn removing_demanding_app_clears_only_its_marks() {
        let (manager, _clock) = manager();
        manager.update_partitions(&[QueuePartitionUpdate::new(
            "beta",
            "prod",
            res(4, 4),
            res(2, 2),
        )]);
        manager.queue_refreshed(
            &QueueNode::new("root")
                .with_child(QueueNode::new("beta").with_used("prod", res(6, 6))),
        );

        let req_a = requirement_from("attempt-1", "alpha", 1, res(1, 1));
        assert!(manager.try_preempt(
            &req_a,
            &[container("c-1", "beta", res(1, 1))],
            CLUSTER,
            "prod"
        ));
        let req_z = requirement_from("attempt-2", "gamma", 1, res(1, 1));
        assert!(manager.try_preempt(
            &req_z,
            &[container("c-2", "beta", res(1, 1))],
            CLUSTER,
            "prod"
        ));

        manager.unmark_demanding_app(&AttemptId::new("attempt-1"));

        assert!(!manager.is_marked(&ContainerId::new("c-1")));
        assert!(manager.is_marked(&ContainerId::new("c-2")));
        assert_eq!(manager.total_marked("beta", "prod"), res(1, 1));
        assert_eq!(manager.total_marked("alpha", "prod"), Resource::zero());
        assert_eq!(manager.total_marked("gamma", "prod"), res(1, 1));
    }

    #[test]
    fn debtor_queue_can_never_reclaim() {
        let (manager, _clock) = manager();
        manager.update_partitions(&[
            QueuePartitionUpdate::new("alpha", "prod", res(4, 4), res(-2, -2)),
            QueuePartitionUpdate::new("beta", "prod", res(4, 4), res(2, 2)),
        ]);

        assert!(!manager.can_queue_preempt(CLUSTER, "beta", "prod", res(1, 1)));
        assert!(manager.can_queue_preempt(CLUSTER, "alpha", "prod", res(1, 1)));
    }

    #[test]
    fn labeled_demand_tracks_both_buckets() {
        let (manager, _clock) = manager();
        manager.update_partitions(&[QueuePartitionUpdate::new(
            "beta",
            "prod",
            res(4, 4),
            res(2, 2),
        )]);
        manager.queue_refreshed(
            &QueueNode::new("root")
                .with_child(QueueNode::new("beta").with_used("prod", res(6, 6))),
        );

        let label = ResourceName::label("node-1").unwrap_or(ResourceName::Any);
        let req = ResourceRequirement::new(
            ApplicationHandle::new(AttemptId::new("attempt-1"), "alpha", "alice"),
            Priority::new(1),
            label.clone(),
            res(1, 1),
        );
        assert!(manager.try_preempt(
            &req,
            &[container("c-1", "beta", res(1, 1))],
            CLUSTER,
            "prod"
        ));

        let attempt = AttemptId::new("attempt-1");
        assert_eq!(
            manager.resources_marked_for(&attempt, Priority::new(1), &label),
            res(1, 1)
        );
        assert_eq!(
            manager.resources_marked_for(&attempt, Priority::new(1), &ResourceName::Any),
            res(1, 1)
        );

        // Cancelling subtracts from both buckets symmetrically.
        manager.unmark_container(&ContainerId::new("c-1"));
        assert_eq!(
            manager.resources_marked_for(&attempt, Priority::new(1), &label),
            Resource::zero()
        );
        assert_eq!(
            manager.resources_marked_for(&attempt, Priority::new(1), &ResourceName::Any),
            Resource::zero()
        );
    }

    #[test]
    fn marks_and_measures_stay_conserved() {
        let (manager, _clock) = manager();
        manager.update_partitions(&[
            QueuePartitionUpdate::new("beta", "prod", res(4, 4), res(2, 2)),
            QueuePartitionUpdate::new("gamma", "prod", res(4, 4), res(3, 3)),
        ]);
        manager.queue_refreshed(
            &QueueNode::new("root")
                .with_child(QueueNode::new("beta").with_used("prod", res(6, 6)))
                .with_child(QueueNode::new("gamma").with_used("prod", res(8, 8))),
        );

        let req = requirement_from("attempt-1", "alpha", 1, res(3, 3));
        let candidates = vec![
            container("c-1", "beta", res(1, 1)),
            container("c-2", "gamma", res(2, 2)),
        ];
        assert!(manager.try_preempt(&req, &candidates, CLUSTER, "prod"));

        // Container-side totals, the demander-side total, and the demanding
        // app's any-node aggregate all account for the same resource.
        let container_side =
            manager.total_marked("beta", "prod") + manager.total_marked("gamma", "prod");
        let demander_side = manager.total_marked("alpha", "prod");
        let app_aggregate = manager.resources_marked_for(
            &AttemptId::new("attempt-1"),
            Priority::new(1),
            &ResourceName::Any,
        );

        assert_eq!(container_side, res(3, 3));
        assert_eq!(demander_side, res(3, 3));
        assert_eq!(app_aggregate, res(3, 3));
    }
}
