//! Process classes, cluster roles, and the class-to-role fitness order.

use serde::{Deserialize, Serialize};

/// Declared class of a worker process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProcessClass {
    Unset,
    Storage,
    Log,
    Transaction,
    Resolution,
    Proxy,
    Master,
    ClusterController,
    Stateless,
    Tester,
}

/// Singleton (or pooled) roles the recruiter fills from the worker set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClusterRole {
    ClusterController,
    Master,
    Proxy,
    Resolver,
}

/// Ordinal quality of a class for a role; lower is better.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Fitness {
    Best,
    Good,
    Okay,
    Unset,
    Worst,
    /// Only acceptable when every non-excluded candidate is unusable.
    ExcludeFit,
    NeverAssign,
}

impl ProcessClass {
    /// The class a role prefers above all others.
    fn preferred_for(role: ClusterRole) -> ProcessClass {
        match role {
            ClusterRole::ClusterController => ProcessClass::ClusterController,
            ClusterRole::Master => ProcessClass::Master,
            ClusterRole::Proxy => ProcessClass::Proxy,
            ClusterRole::Resolver => ProcessClass::Resolution,
        }
    }

    /// Fitness of this class when filling `role`.
    pub fn fitness_for(self, role: ClusterRole) -> Fitness {
        if self == Self::preferred_for(role) {
            return Fitness::Best;
        }
        match self {
            ProcessClass::Tester => Fitness::NeverAssign,
            ProcessClass::Stateless => Fitness::Good,
            ProcessClass::Unset => Fitness::Unset,
            // Stateful classes should keep their disks to themselves.
            ProcessClass::Storage | ProcessClass::Log => Fitness::Worst,
            // Other transaction-subsystem classes are usable in a pinch.
            ProcessClass::Transaction
            | ProcessClass::Resolution
            | ProcessClass::Proxy
            | ProcessClass::Master
            | ProcessClass::ClusterController => Fitness::Okay,
        }
    }
}

/// Best fitness achievable for `role` given the class types present.
pub fn best_available_fitness(
    classes: impl IntoIterator<Item = ProcessClass>,
    role: ClusterRole,
) -> Fitness {
    classes
        .into_iter()
        .map(|class| class.fitness_for(role))
        .min()
        .unwrap_or(Fitness::NeverAssign)
}
