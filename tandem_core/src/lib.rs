//! Core types shared by every node of a tandem federation: the fixed-point
//! simulation [`Time`], the identifier spaces, and the iteration records
//! exchanged on every time request.

pub mod ids;
pub mod time;

// Re-exports
pub use ids::{GlobalFederateId, GlobalHandle, InterfaceHandle, RouteId};
pub use time::{Time, TimeParseError, TimeUnit};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Iteration behavior requested alongside a time request.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum IterationRequest {
    /// Forbid same-time re-entry; the grant must advance time.
    #[default]
    NoIterations,
    /// Require at least one same-time re-entry.
    ForceIteration,
    /// Iterate only if a dependency produced new data at the granted time.
    IterateIfNeeded,
}

/// Outcome of a granted time request.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationResult {
    /// Time advanced to a new step.
    NextStep,
    /// Re-entry at the same time value.
    Iterating,
    /// The federation is shutting down; no further grants will arrive.
    Halted,
    /// The federate is in the error state.
    Error,
}

/// The time and completion marker returned from every time request.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationTime {
    /// The time of the granted step.
    pub granted_time: Time,
    /// The convergence state.
    pub state: IterationResult,
}

impl IterationTime {
    pub const fn new(granted_time: Time, state: IterationResult) -> Self {
        Self {
            granted_time,
            state,
        }
    }
}
