//! Aggregate root trait for state-based domain models.

/// Aggregate root marker + minimal interface.
///
/// Aggregates own their state and the events they raise while a business operation
/// is in flight. Persisting the state and the raised events is an infrastructure
/// concern handled by the unit of work, never by the aggregate itself.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Monotonically increasing version of the aggregate's state.
    ///
    /// Incremented by the aggregate on every accepted state change.
    fn version(&self) -> u64;
}
