//! The command tag carried by every [`ActionMessage`](crate::ActionMessage).

/// Command tag of an envelope. Wire values are stable; new tags may only be
/// appended. Values at or above [`Action::RESERVED_BASE`] are reserved for
/// future protocol revisions and decode to [`Action::Unknown`] without being
/// treated as fatal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Action {
    /// No-op command, discarded on receipt.
    #[default]
    Ignore = 0,

    // Connection management
    RegisterFederate = 1,
    FederateAck = 2,
    RegisterCore = 3,
    CoreAck = 4,
    RegisterBroker = 5,
    BrokerAck = 6,

    // Interface registration
    RegisterPublication = 10,
    RegisterInput = 11,
    RegisterEndpoint = 12,
    RegisterFilter = 13,
    RemovePublication = 14,
    RemoveInput = 15,
    RemoveEndpoint = 16,
    RemoveFilter = 17,

    // Interface connections
    AddSubscriber = 20,
    RemoveSubscriber = 21,
    AddPublisher = 22,
    RemovePublisher = 23,
    AddEndpointLink = 24,
    RemoveEndpointLink = 25,
    AddFilterTarget = 26,
    RemoveFilterTarget = 27,

    // Coordinator graph maintenance
    AddDependency = 30,
    RemoveDependency = 31,
    AddDependent = 32,
    RemoveDependent = 33,

    // Lifecycle barriers
    InitRequest = 40,
    InitGrant = 41,
    ExecRequest = 42,
    ExecGrant = 43,

    // Time coordination
    TimeRequest = 50,
    TimeGrant = 51,
    TimeReport = 52,
    RequestIteration = 53,

    // Data exchange
    Publish = 60,
    SendMessage = 61,
    SendForFilter = 62,
    FilterResult = 63,
    NullMessage = 64,

    // Shutdown
    Finalize = 70,
    Disconnect = 71,
    DisconnectFederate = 72,
    DisconnectCore = 73,
    DisconnectBroker = 74,
    DisconnectAck = 75,
    Terminate = 76,

    // Errors and diagnostics
    Error = 80,
    Warning = 81,
    Ack = 82,
    LocalError = 83,
    GlobalError = 84,

    // Queries and liveness
    Query = 90,
    QueryReply = 91,
    Ping = 92,
    Pong = 93,
    Tick = 94,

    // Misc
    Protocol = 100,
    ProfilerData = 101,

    /// Sentinel for a tag this version does not recognize. Never forwarded.
    Unknown = 0xFFFF,
}

impl Action {
    /// Tags at or above this value are reserved for future use; receiving one
    /// is a warning, not a protocol error.
    pub const RESERVED_BASE: u16 = 0x4000;

    pub const fn from_wire(value: u16) -> Self {
        match value {
            0 => Action::Ignore,
            1 => Action::RegisterFederate,
            2 => Action::FederateAck,
            3 => Action::RegisterCore,
            4 => Action::CoreAck,
            5 => Action::RegisterBroker,
            6 => Action::BrokerAck,
            10 => Action::RegisterPublication,
            11 => Action::RegisterInput,
            12 => Action::RegisterEndpoint,
            13 => Action::RegisterFilter,
            14 => Action::RemovePublication,
            15 => Action::RemoveInput,
            16 => Action::RemoveEndpoint,
            17 => Action::RemoveFilter,
            20 => Action::AddSubscriber,
            21 => Action::RemoveSubscriber,
            22 => Action::AddPublisher,
            23 => Action::RemovePublisher,
            24 => Action::AddEndpointLink,
            25 => Action::RemoveEndpointLink,
            26 => Action::AddFilterTarget,
            27 => Action::RemoveFilterTarget,
            30 => Action::AddDependency,
            31 => Action::RemoveDependency,
            32 => Action::AddDependent,
            33 => Action::RemoveDependent,
            40 => Action::InitRequest,
            41 => Action::InitGrant,
            42 => Action::ExecRequest,
            43 => Action::ExecGrant,
            50 => Action::TimeRequest,
            51 => Action::TimeGrant,
            52 => Action::TimeReport,
            53 => Action::RequestIteration,
            60 => Action::Publish,
            61 => Action::SendMessage,
            62 => Action::SendForFilter,
            63 => Action::FilterResult,
            64 => Action::NullMessage,
            70 => Action::Finalize,
            71 => Action::Disconnect,
            72 => Action::DisconnectFederate,
            73 => Action::DisconnectCore,
            74 => Action::DisconnectBroker,
            75 => Action::DisconnectAck,
            76 => Action::Terminate,
            80 => Action::Error,
            81 => Action::Warning,
            82 => Action::Ack,
            83 => Action::LocalError,
            84 => Action::GlobalError,
            90 => Action::Query,
            91 => Action::QueryReply,
            92 => Action::Ping,
            93 => Action::Pong,
            94 => Action::Tick,
            100 => Action::Protocol,
            101 => Action::ProfilerData,
            _ => Action::Unknown,
        }
    }

    pub const fn to_wire(self) -> u16 {
        self as u16
    }

    /// True for control traffic that must overtake ordinary traffic at every
    /// mailbox: registrations and their replies, barriers, errors,
    /// disconnects, and queries.
    pub const fn is_priority(self) -> bool {
        matches!(
            self,
            Action::RegisterFederate
                | Action::FederateAck
                | Action::RegisterCore
                | Action::CoreAck
                | Action::RegisterBroker
                | Action::BrokerAck
                | Action::RegisterPublication
                | Action::RegisterInput
                | Action::RegisterEndpoint
                | Action::RegisterFilter
                | Action::InitRequest
                | Action::InitGrant
                | Action::ExecRequest
                | Action::ExecGrant
                | Action::Finalize
                | Action::Disconnect
                | Action::DisconnectFederate
                | Action::DisconnectCore
                | Action::DisconnectBroker
                | Action::DisconnectAck
                | Action::Terminate
                | Action::Error
                | Action::LocalError
                | Action::GlobalError
                | Action::Query
                | Action::QueryReply
                | Action::Protocol
        )
    }

    /// True for actions whose envelope carries the extra info block
    /// (names and coordinator times).
    pub const fn uses_extra(self) -> bool {
        matches!(
            self,
            Action::RegisterFederate
                | Action::RegisterPublication
                | Action::RegisterInput
                | Action::RegisterEndpoint
                | Action::RegisterFilter
                | Action::AddSubscriber
                | Action::AddPublisher
                | Action::AddFilterTarget
                | Action::TimeRequest
                | Action::TimeReport
                | Action::TimeGrant
                | Action::SendMessage
                | Action::SendForFilter
                | Action::FilterResult
                | Action::Query
                | Action::QueryReply
        )
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        for v in 0..0x200u16 {
            let action = Action::from_wire(v);
            if action != Action::Unknown {
                assert_eq!(action.to_wire(), v);
            }
        }
        assert_eq!(Action::from_wire(0xFFFF), Action::Unknown);
        assert_eq!(Action::from_wire(0x4001), Action::Unknown);
    }

    #[test]
    fn priority_classes() {
        assert!(Action::Error.is_priority());
        assert!(Action::RegisterFederate.is_priority());
        assert!(!Action::Publish.is_priority());
        assert!(!Action::TimeRequest.is_priority());
        assert!(!Action::SendMessage.is_priority());
    }
}
