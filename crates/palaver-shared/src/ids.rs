//! Identifier types and the sortable message-id generator.
//!
//! User and group ids are prefixed strings (`U…` / `G…`); the prefix is
//! the namespace that routing branches on, so it is validated here and
//! nowhere else.  Message ids are 64-bit, time-sortable and unique
//! across nodes.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;

/// Namespace prefix for user ids.
pub const USER_ID_PREFIX: char = 'U';

/// Namespace prefix for group ids.
pub const GROUP_ID_PREFIX: char = 'G';

// ---------------------------------------------------------------------------
// MessageId
// ---------------------------------------------------------------------------

/// Sortable 64-bit message identifier.
///
/// Doubles as the storage key and the delivery-acknowledgement token
/// carried on outbound envelopes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Custom epoch for id timestamps: 2024-01-01T00:00:00Z in millis.
const ID_EPOCH_MS: i64 = 1_704_067_200_000;

const NODE_BITS: u8 = 10;
const SEQUENCE_BITS: u8 = 12;
const MAX_NODE_ID: i64 = (1 << NODE_BITS) - 1;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

/// Distributed message-id generator.
///
/// Layout: 41 bits of millisecond timestamp since [`ID_EPOCH_MS`], 10
/// bits of node id, 12 bits of per-millisecond sequence.  Ids from one
/// generator are strictly increasing; ids from different nodes never
/// collide.
pub struct MessageIdGen {
    node_id: i64,
    state: Mutex<GenState>,
}

struct GenState {
    last_ms: i64,
    sequence: i64,
}

impl MessageIdGen {
    /// Create a generator for the given node id (0..1024).
    pub fn new(node_id: u16) -> Result<Self, ProtocolError> {
        if i64::from(node_id) > MAX_NODE_ID {
            return Err(ProtocolError::NodeIdOutOfRange(node_id));
        }
        Ok(Self {
            node_id: i64::from(node_id),
            state: Mutex::new(GenState {
                last_ms: -1,
                sequence: 0,
            }),
        })
    }

    /// Produce the next id.  Never blocks and never goes backwards, even
    /// if the wall clock does.
    pub fn next(&self) -> MessageId {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let mut now = current_ms();
        if now < state.last_ms {
            // Clock regression: keep handing out ids in the last
            // observed millisecond rather than emitting unsorted ids.
            now = state.last_ms;
        }

        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted for this millisecond; advance
                // logically instead of spinning on the clock.
                now = state.last_ms + 1;
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        let id = ((now - ID_EPOCH_MS) << (NODE_BITS + SEQUENCE_BITS))
            | (self.node_id << SEQUENCE_BITS)
            | state.sequence;
        MessageId(id)
    }

    /// The node id this generator stamps into every id.
    pub fn node_id(&self) -> u16 {
        self.node_id as u16
    }
}

fn current_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ---------------------------------------------------------------------------
// UserId / GroupId
// ---------------------------------------------------------------------------

/// A user identity, always `U`-prefixed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Validate and wrap a raw id string.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        if raw.len() < 2 || !raw.starts_with(USER_ID_PREFIX) {
            return Err(ProtocolError::InvalidUserId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// Mint a fresh user id.
    pub fn generate() -> Self {
        Self(format!("{}{}", USER_ID_PREFIX, Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = ProtocolError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

/// A group identity, always `G`-prefixed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    /// Validate and wrap a raw id string.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        if raw.len() < 2 || !raw.starts_with(GROUP_ID_PREFIX) {
            return Err(ProtocolError::InvalidGroupId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// Mint a fresh group id.
    pub fn generate() -> Self {
        Self(format!("{}{}", GROUP_ID_PREFIX, Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GroupId {
    type Err = ProtocolError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

// ---------------------------------------------------------------------------
// Recipient
// ---------------------------------------------------------------------------

/// A message recipient: one user or one group, decided by the id's
/// namespace prefix.  Routing depends on this branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Recipient {
    User(UserId),
    Group(GroupId),
}

impl Recipient {
    /// Branch on the first byte of the raw id.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        match raw.chars().next() {
            Some(USER_ID_PREFIX) => Ok(Recipient::User(UserId::parse(raw)?)),
            Some(GROUP_ID_PREFIX) => Ok(Recipient::Group(GroupId::parse(raw)?)),
            _ => Err(ProtocolError::UnknownRecipientScope(raw.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Recipient::User(user) => user.as_str(),
            Recipient::Group(group) => group.as_str(),
        }
    }
}

impl TryFrom<String> for Recipient {
    type Error = ProtocolError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Recipient::parse(&raw)
    }
}

impl From<Recipient> for String {
    fn from(recipient: Recipient) -> String {
        recipient.as_str().to_string()
    }
}

impl FromStr for Recipient {
    type Err = ProtocolError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ConversationKey
// ---------------------------------------------------------------------------

/// Key identifying a conversation for history and cache purposes.
///
/// Direct conversations use the ordered pair of participant ids so that
/// both sides derive the same key; groups use the group id as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn direct(a: &UserId, b: &UserId) -> Self {
        let (lo, hi) = if a.as_str() <= b.as_str() {
            (a, b)
        } else {
            (b, a)
        };
        Self(format!("{}:{}", lo.as_str(), hi.as_str()))
    }

    pub fn group(group: &GroupId) -> Self {
        Self(group.as_str().to_string())
    }

    /// Wrap an already-formatted key (e.g. from a URL path).
    pub fn from_raw(raw: &str) -> Self {
        Self(raw.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_sortable_and_unique() {
        let gen = MessageIdGen::new(3).unwrap();
        let mut previous = gen.next();
        for _ in 0..10_000 {
            let id = gen.next();
            assert!(id > previous);
            previous = id;
        }
    }

    #[test]
    fn node_id_out_of_range_rejected() {
        assert!(MessageIdGen::new(1023).is_ok());
        assert!(MessageIdGen::new(1024).is_err());
    }

    #[test]
    fn different_nodes_never_collide() {
        let a = MessageIdGen::new(1).unwrap();
        let b = MessageIdGen::new(2).unwrap();
        let id_a = a.next();
        let id_b = b.next();
        assert_ne!(id_a, id_b);
    }

    #[test]
    fn recipient_prefix_branch() {
        assert!(matches!(
            Recipient::parse("U42").unwrap(),
            Recipient::User(_)
        ));
        assert!(matches!(
            Recipient::parse("G42").unwrap(),
            Recipient::Group(_)
        ));
        assert!(Recipient::parse("X42").is_err());
        assert!(Recipient::parse("").is_err());
    }

    #[test]
    fn generated_ids_parse_back() {
        let user = UserId::generate();
        assert!(UserId::parse(user.as_str()).is_ok());
        let group = GroupId::generate();
        assert!(GroupId::parse(group.as_str()).is_ok());
    }

    #[test]
    fn direct_key_is_order_independent() {
        let a = UserId::parse("Ualice").unwrap();
        let b = UserId::parse("Ubob").unwrap();
        assert_eq!(ConversationKey::direct(&a, &b), ConversationKey::direct(&b, &a));
    }

    #[test]
    fn recipient_serde_round_trip() {
        let recipient = Recipient::parse("Galpha").unwrap();
        let json = serde_json::to_string(&recipient).unwrap();
        assert_eq!(json, "\"Galpha\"");
        let back: Recipient = serde_json::from_str(&json).unwrap();
        assert_eq!(back, recipient);
    }
}
