//! Invariant checking for deterministic simulation testing.
//!
//! Invariants are properties that must hold after every step of every run,
//! whatever the interleaving or injected failures. Checks read a
//! [`ClusterSnapshot`] taken from [`crate::SimCluster::snapshot`].
//!
//! # Usage
//!
//! ```ignore
//! let registry = InvariantRegistry::standard();
//! registry.assert_all(&cluster.snapshot(), "after ban");
//! ```

mod checks;
mod snapshot;

pub use checks::{
    ClosedSocketsStaySilent, ConnectionAccounting, ConnectionLimits, DeadLetterBound,
    SingleAttachment,
};
pub use snapshot::{ClusterSnapshot, InstanceSnapshot, Limits, SocketSnapshot};

/// Invariant check result.
pub type InvariantResult = Result<(), Violation>;

/// Invariant violation with context.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Name of the violated invariant.
    pub invariant: &'static str,
    /// What went wrong.
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// A property checked against cluster state.
pub trait Invariant: Send + Sync {
    /// Name for error reporting.
    fn name(&self) -> &'static str;

    /// `Ok(())` if the property holds.
    fn check(&self, state: &ClusterSnapshot) -> InvariantResult;
}

/// Registry of invariants to check.
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// Registry with every standard cluster invariant.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(ConnectionLimits);
        registry.add(DeadLetterBound);
        registry.add(ClosedSocketsStaySilent);
        registry.add(ConnectionAccounting);
        registry.add(SingleAttachment);
        registry
    }

    /// Add an invariant.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Check every invariant, collecting all violations.
    pub fn check_all(&self, state: &ClusterSnapshot) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> =
            self.invariants.iter().filter_map(|inv| inv.check(state).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Check every invariant, panicking with all violations found.
    #[allow(clippy::panic)]
    pub fn assert_all(&self, state: &ClusterSnapshot, context: &str) {
        if let Err(violations) = self.check_all(state) {
            let messages: Vec<_> = violations.iter().map(ToString::to_string).collect();
            panic!("invariant violation {context}:\n  {}", messages.join("\n  "));
        }
    }

    /// Number of registered invariants.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_has_invariants() {
        assert_eq!(InvariantRegistry::standard().len(), 5);
    }

    #[test]
    fn empty_snapshot_passes() {
        let registry = InvariantRegistry::standard();
        assert!(registry.check_all(&ClusterSnapshot::empty()).is_ok());
    }
}
