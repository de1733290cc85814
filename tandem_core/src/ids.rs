//! Identifier spaces used throughout a federation.
//!
//! Three id spaces exist, all 32-bit signed with 0 reserved as the invalid
//! sentinel: [`GlobalFederateId`] (assigned by the root broker),
//! [`InterfaceHandle`] (locally unique within a federate), and [`RouteId`]
//! (per-node mapping to an outbound link, opaque outside its owner).

use std::fmt::Display;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Federate ids are allocated starting at this value; smaller positive values
/// identify brokers and cores.
pub const FEDERATE_ID_BASE: i32 = 131_072;

/// Identifier for a federate (or broker/core acting as a timing node),
/// unique across the whole federation tree. Assigned by the root broker at
/// registration.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct GlobalFederateId(i32);

impl GlobalFederateId {
    pub const INVALID: Self = Self(0);

    pub const fn new(base: i32) -> Self {
        Self(base)
    }

    pub const fn base_value(self) -> i32 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// True if this id falls in the federate allocation range.
    pub const fn is_federate(self) -> bool {
        self.0 >= FEDERATE_ID_BASE
    }

    /// True if this id identifies a broker or core.
    pub const fn is_broker(self) -> bool {
        self.0 > 0 && self.0 < FEDERATE_ID_BASE
    }
}

impl Display for GlobalFederateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fed:{}", self.0)
    }
}

/// Identifier for an interface (publication, input, endpoint, or filter),
/// locally unique within its owning federate.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct InterfaceHandle(i32);

impl InterfaceHandle {
    pub const INVALID: Self = Self(0);

    pub const fn new(base: i32) -> Self {
        Self(base)
    }

    pub const fn base_value(self) -> i32 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl Display for InterfaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "hnd:{}", self.0)
    }
}

/// The pair `(federate, handle)`, globally unique across the federation.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobalHandle {
    pub federate: GlobalFederateId,
    pub handle: InterfaceHandle,
}

impl GlobalHandle {
    pub const INVALID: Self = Self {
        federate: GlobalFederateId::INVALID,
        handle: InterfaceHandle::INVALID,
    };

    pub const fn new(federate: GlobalFederateId, handle: InterfaceHandle) -> Self {
        Self { federate, handle }
    }

    pub const fn is_valid(self) -> bool {
        self.federate.is_valid() && self.handle.is_valid()
    }
}

impl Display for GlobalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({},{})",
            self.federate.base_value(),
            self.handle.base_value()
        )
    }
}

/// Per-node identifier for an outbound link. Route 0 is always the parent.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct RouteId(i32);

impl RouteId {
    /// The route to the parent node (broker or parent broker).
    pub const PARENT: Self = Self(0);
    pub const INVALID: Self = Self(i32::MIN);

    pub const fn new(base: i32) -> Self {
        Self(base)
    }

    pub const fn base_value(self) -> i32 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != i32::MIN
    }
}

impl Default for RouteId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl Display for RouteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "route:{}", self.0)
    }
}
