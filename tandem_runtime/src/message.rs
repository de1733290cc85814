//! The uniform envelope exchanged between every pair of nodes, and its
//! deterministic binary codec.
//!
//! Wire layout (little-endian): a 32-byte fixed header (`action`, `flags`,
//! routing coordinates, `action_time`, `iteration`), a length-prefixed
//! payload, then zero or more tagged sections. Section tag 1 is the extra
//! info block; unrecognized tags are preserved on decode and re-emitted on
//! encode but never acted upon, so newer peers can append sections without
//! breaking older ones.

use bytes::{Buf, BufMut};
use tandem_core::{GlobalFederateId, InterfaceHandle, Time};

use crate::Action;

/// Maximum accepted payload size; larger envelopes are rejected at decode.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

const HEADER_SIZE: usize = 32;
const SECTION_EXTRA: u8 = 1;

/// Bitfield carried in the envelope header.
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Flags(u16);

impl Flags {
    /// A matching counterpart is required (e.g. an input that must bind).
    pub const REQUIRED: Flags = Flags(1 << 0);
    /// The interface is optional; binding failures are not errors.
    pub const OPTIONAL: Flags = Flags(1 << 1);
    /// The envelope signals an error condition.
    pub const ERROR: Flags = Flags(1 << 2);
    /// The sender has finished iterating at the carried time.
    pub const ITERATION_COMPLETE: Flags = Flags(1 << 3);
    /// The sender is iterating (unconverged) at the carried time.
    pub const ITERATING: Flags = Flags(1 << 4);
    /// The sender requires at least one iteration before advancing.
    pub const FORCE_ITERATION: Flags = Flags(1 << 5);
    /// The filter intercepts messages at their destination.
    pub const DEST_FILTER: Flags = Flags(1 << 6);
    /// Value updates are suppressed when the payload is unchanged.
    pub const ONLY_UPDATE_ON_CHANGE: Flags = Flags(1 << 7);
    /// Source filters have already been applied to this message.
    pub const SRC_FILTERED: Flags = Flags(1 << 8);
    /// Destination filters have already been applied to this message.
    pub const DST_FILTERED: Flags = Flags(1 << 9);

    pub const fn empty() -> Self {
        Flags(0)
    }

    pub const fn contains(self, flag: Flags) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn set(&mut self, flag: Flags) {
        self.0 |= flag.0;
    }

    pub fn clear(&mut self, flag: Flags) {
        self.0 &= !flag.0;
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn from_bits(bits: u16) -> Self {
        Flags(bits)
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Self) -> Self::Output {
        Flags(self.0 | rhs.0)
    }
}

impl std::fmt::Debug for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Flags({:#06x})", self.0)
    }
}

/// Secondary record carried only by some actions: interface names for
/// registration and binding, and the coordinator times for time traffic.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ExtraInfo {
    pub source_name: String,
    pub original_source: String,
    pub target_name: String,
    /// Earliest time the sender itself could next need input.
    pub te: Time,
    /// Earliest event time propagated recursively from the sender's
    /// dependencies.
    pub tdemin: Time,
    /// Offset applied to the sender's outputs. Always encoded, zero when
    /// unused.
    pub tso: Time,
}

/// The single record exchanged between nodes.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ActionMessage {
    pub action: Action,
    pub flags: Flags,
    pub source_id: GlobalFederateId,
    /// Source interface handle. Time reports reuse this field to carry the
    /// id of the federate that constrained `tdemin`.
    pub source_handle: InterfaceHandle,
    pub dest_id: GlobalFederateId,
    pub dest_handle: InterfaceHandle,
    pub action_time: Time,
    pub iteration: i32,
    pub payload: Vec<u8>,
    pub extra: Option<Box<ExtraInfo>>,
    /// Tagged sections this version does not recognize; preserved verbatim.
    pub unknown_sections: Vec<(u8, Vec<u8>)>,
}

impl ActionMessage {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            ..Default::default()
        }
    }

    /// The extra info block, allocated on first use.
    pub fn extra_mut(&mut self) -> &mut ExtraInfo {
        self.extra.get_or_insert_with(Default::default)
    }

    /// The payload interpreted as a name string (registration traffic
    /// carries the interface key in the payload).
    pub fn name(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or("")
    }

    pub fn set_name(&mut self, name: &str) {
        self.payload = name.as_bytes().to_vec();
    }

    pub fn is_priority(&self) -> bool {
        self.action.is_priority()
    }

    pub fn is_error(&self) -> bool {
        self.flags.contains(Flags::ERROR)
            || matches!(
                self.action,
                Action::Error | Action::LocalError | Action::GlobalError
            )
    }

    /// Encode to the deterministic binary form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + 4 + self.payload.len());
        buf.put_u16_le(self.action.to_wire());
        buf.put_u16_le(self.flags.bits());
        buf.put_i32_le(self.source_id.base_value());
        buf.put_i32_le(self.source_handle.base_value());
        buf.put_i32_le(self.dest_id.base_value());
        buf.put_i32_le(self.dest_handle.base_value());
        buf.put_i64_le(self.action_time.count());
        buf.put_i32_le(self.iteration);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        if let Some(extra) = &self.extra {
            let mut body = Vec::with_capacity(
                12 + extra.source_name.len()
                    + extra.original_source.len()
                    + extra.target_name.len()
                    + 24,
            );
            put_string(&mut body, &extra.source_name);
            put_string(&mut body, &extra.original_source);
            put_string(&mut body, &extra.target_name);
            body.put_i64_le(extra.te.count());
            body.put_i64_le(extra.tdemin.count());
            body.put_i64_le(extra.tso.count());
            buf.put_u8(SECTION_EXTRA);
            buf.put_u32_le(body.len() as u32);
            buf.put_slice(&body);
        }
        for (tag, body) in &self.unknown_sections {
            buf.put_u8(*tag);
            buf.put_u32_le(body.len() as u32);
            buf.put_slice(body);
        }
        buf
    }

    /// Decode from bytes. Truncated input and oversized payloads are
    /// rejected; an unrecognized action tag maps to [`Action::Unknown`],
    /// which the receiver must not forward.
    pub fn from_bytes(mut buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_SIZE + 4 {
            return Err(CodecError::Truncated);
        }
        let raw_action = buf.get_u16_le();
        let action = Action::from_wire(raw_action);
        if action == Action::Unknown && raw_action < Action::RESERVED_BASE {
            // A same-version peer produced a tag we do not know: protocol
            // error. Tags in the reserved range decode to the sentinel and
            // are dropped with a warning instead.
            return Err(CodecError::UnknownAction(raw_action));
        }
        let flags = Flags::from_bits(buf.get_u16_le());
        let source_id = GlobalFederateId::new(buf.get_i32_le());
        let source_handle = InterfaceHandle::new(buf.get_i32_le());
        let dest_id = GlobalFederateId::new(buf.get_i32_le());
        let dest_handle = InterfaceHandle::new(buf.get_i32_le());
        let action_time = Time::from_count(buf.get_i64_le());
        let iteration = buf.get_i32_le();

        let payload_len = buf.get_u32_le() as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge(payload_len));
        }
        if buf.remaining() < payload_len {
            return Err(CodecError::Truncated);
        }
        let payload = buf[..payload_len].to_vec();
        buf.advance(payload_len);

        let mut extra = None;
        let mut unknown_sections = Vec::new();
        while buf.has_remaining() {
            if buf.remaining() < 5 {
                return Err(CodecError::Truncated);
            }
            let tag = buf.get_u8();
            let len = buf.get_u32_le() as usize;
            if buf.remaining() < len {
                return Err(CodecError::Truncated);
            }
            let mut body = &buf[..len];
            buf.advance(len);
            match tag {
                SECTION_EXTRA => {
                    let source_name = get_string(&mut body)?;
                    let original_source = get_string(&mut body)?;
                    let target_name = get_string(&mut body)?;
                    if body.remaining() < 24 {
                        return Err(CodecError::Truncated);
                    }
                    let te = Time::from_count(body.get_i64_le());
                    let tdemin = Time::from_count(body.get_i64_le());
                    let tso = Time::from_count(body.get_i64_le());
                    extra = Some(Box::new(ExtraInfo {
                        source_name,
                        original_source,
                        target_name,
                        te,
                        tdemin,
                        tso,
                    }));
                }
                tag => unknown_sections.push((tag, body.to_vec())),
            }
        }

        Ok(Self {
            action,
            flags,
            source_id,
            source_handle,
            dest_id,
            dest_handle,
            action_time,
            iteration,
            payload,
            extra,
            unknown_sections,
        })
    }
}

impl std::fmt::Display for ActionMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{} {}->{} t={}]",
            self.action, self.source_id, self.dest_id, self.action_time
        )
    }
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut &[u8]) -> Result<String, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::Truncated);
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(CodecError::Truncated);
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| CodecError::InvalidString)?
        .to_owned();
    buf.advance(len);
    Ok(s)
}

/// The error type for envelope decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("envelope truncated")]
    Truncated,

    #[error("payload of {0} bytes exceeds the configured maximum")]
    PayloadTooLarge(usize),

    #[error("unknown action tag {0:#06x} outside the reserved range")]
    UnknownAction(u16),

    #[error("string field is not valid UTF-8")]
    InvalidString,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(m: &ActionMessage) -> ActionMessage {
        let decoded = ActionMessage::from_bytes(&m.to_bytes()).unwrap();
        assert_eq!(&decoded, m);
        decoded
    }

    #[test]
    fn plain_round_trip() {
        let mut m = ActionMessage::new(Action::Ignore);
        m.action_time = Time::from_seconds(47.2342);
        m.payload = b"this is a string that is sufficiently long".to_vec();
        m.source_handle = InterfaceHandle::new(4);
        m.source_id = GlobalFederateId::new(232324);
        m.dest_id = GlobalFederateId::new(22552215);
        m.dest_handle = InterfaceHandle::new(2322342);
        round_trip(&m);
    }

    #[test]
    fn extra_round_trip() {
        let mut m = ActionMessage::new(Action::RegisterInput);
        m.action_time = Time::from_seconds(47.2342);
        m.payload = b"this is a string that is sufficiently long".to_vec();
        m.source_handle = InterfaceHandle::new(4);
        m.source_id = GlobalFederateId::new(232324);
        m.dest_id = GlobalFederateId::new(22552215);
        m.dest_handle = InterfaceHandle::new(2322342);
        let extra = m.extra_mut();
        extra.source_name = "this is a message source of something else".into();
        extra.original_source = "this is a different message source".into();
        extra.target_name = "a message target".into();
        extra.te = Time::from_seconds(24.2);
        extra.tdemin = Time::from_seconds(2342342.234_23);
        round_trip(&m);
    }

    #[test]
    fn empty_and_binary_payloads() {
        let m = ActionMessage::new(Action::Publish);
        round_trip(&m);

        let mut m = ActionMessage::new(Action::Publish);
        m.payload = vec![0, 1, 2, 0, 0, 255, 0, 42];
        round_trip(&m);
    }

    #[test]
    fn every_tag_round_trips() {
        for v in 0..120u16 {
            let action = Action::from_wire(v);
            if action == Action::Unknown {
                continue;
            }
            let mut m = ActionMessage::new(action);
            m.action_time = Time::from_count(v as i64);
            m.payload = vec![b'x'; v as usize];
            round_trip(&m);
        }
    }

    #[test]
    fn unknown_trailing_sections_preserved() {
        let mut m = ActionMessage::new(Action::Publish);
        m.payload = b"data".to_vec();
        let mut bytes = m.to_bytes();
        // A tagged section from a future protocol revision.
        bytes.put_u8(42);
        bytes.put_u32_le(3);
        bytes.put_slice(b"abc");

        let decoded = ActionMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.unknown_sections, vec![(42u8, b"abc".to_vec())]);
        // Preserved through re-encoding.
        assert_eq!(decoded.to_bytes(), bytes);
    }

    #[test]
    fn truncated_input_rejected() {
        let mut m = ActionMessage::new(Action::Publish);
        m.payload = b"some payload".to_vec();
        let bytes = m.to_bytes();
        for cut in [0, 10, HEADER_SIZE, bytes.len() - 1] {
            assert_eq!(
                ActionMessage::from_bytes(&bytes[..cut]),
                Err(CodecError::Truncated),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn oversized_payload_rejected() {
        let mut m = ActionMessage::new(Action::Publish);
        m.payload = vec![0u8; 64];
        let mut bytes = m.to_bytes();
        // Forge a payload length beyond the maximum.
        bytes[HEADER_SIZE..HEADER_SIZE + 4]
            .copy_from_slice(&(MAX_PAYLOAD_SIZE as u32 + 1).to_le_bytes());
        assert!(matches!(
            ActionMessage::from_bytes(&bytes),
            Err(CodecError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn unknown_action_handling() {
        let mut m = ActionMessage::new(Action::Publish);
        m.payload = b"x".to_vec();

        // Reserved-for-future-use tags decode to the sentinel.
        let mut bytes = m.to_bytes();
        bytes[0..2].copy_from_slice(&0x4123u16.to_le_bytes());
        let decoded = ActionMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.action, Action::Unknown);

        // A tag outside the reserved range is a protocol error.
        let mut bytes = m.to_bytes();
        bytes[0..2].copy_from_slice(&0x0123u16.to_le_bytes());
        assert_eq!(
            ActionMessage::from_bytes(&bytes),
            Err(CodecError::UnknownAction(0x0123))
        );
    }
}
