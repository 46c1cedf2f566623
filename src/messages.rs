use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A transport capability a peer claims.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ability {
    #[serde(rename = "direct-tcp-v1")]
    DirectTcpV1,
    #[serde(rename = "relay-v1")]
    RelayV1,
}

impl fmt::Display for Ability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ability::DirectTcpV1 => write!(f, "direct-tcp-v1"),
            Ability::RelayV1 => write!(f, "relay-v1"),
        }
    }
}

/// One entry of the `abilities-v1` list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAbility {
    #[serde(rename = "type")]
    pub ability: Ability,
}

/// A concrete endpoint a peer advertises.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hint {
    #[serde(rename = "type")]
    pub ability: Ability,
    pub priority: f64,
    pub hostname: String,
    pub port: u16,
}

impl Hint {
    pub fn direct(hostname: impl Into<String>, port: u16) -> Self {
        Hint {
            ability: Ability::DirectTcpV1,
            priority: 0.0,
            hostname: hostname.into(),
            port,
        }
    }

    pub fn relay(hostname: impl Into<String>, port: u16) -> Self {
        Hint {
            ability: Ability::RelayV1,
            priority: 0.0,
            hostname: hostname.into(),
            port,
        }
    }
}

/// A hint as it appears in the `hints-v1` list: either a single reachable
/// endpoint, or a relay server offering one of several entry points. The
/// wire form is an untagged union, a relay is recognized by its nested
/// `hints` list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConnectionHint {
    Relay {
        #[serde(rename = "type")]
        ability: Ability,
        hints: Vec<Hint>,
    },
    Direct(Hint),
}

impl ConnectionHint {
    pub fn direct(hint: Hint) -> Self {
        ConnectionHint::Direct(hint)
    }

    pub fn relay(hints: Vec<Hint>) -> Self {
        ConnectionHint::Relay {
            ability: Ability::RelayV1,
            hints,
        }
    }

    /// Storage order: direct hints rank as one class ahead of any relay,
    /// relays order by their hint lists.
    pub fn storage_order(a: &ConnectionHint, b: &ConnectionHint) -> Ordering {
        match (a, b) {
            (ConnectionHint::Direct(_), ConnectionHint::Direct(_)) => Ordering::Equal,
            (ConnectionHint::Direct(_), ConnectionHint::Relay { .. }) => Ordering::Less,
            (ConnectionHint::Relay { .. }, ConnectionHint::Direct(_)) => Ordering::Greater,
            (ConnectionHint::Relay { hints: a, .. }, ConnectionHint::Relay { hints: b, .. }) => {
                let mut pairs = a.iter().zip(b.iter());
                loop {
                    match pairs.next() {
                        Some((x, y)) => match hint_order(x, y) {
                            Ordering::Equal => continue,
                            other => break other,
                        },
                        None => break a.len().cmp(&b.len()),
                    }
                }
            }
        }
    }
}

fn hint_order(a: &Hint, b: &Hint) -> Ordering {
    a.hostname
        .cmp(&b.hostname)
        .then(a.port.cmp(&b.port))
        .then(a.priority.total_cmp(&b.priority))
}

/// The negotiation payload of a `transit` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitPayload {
    #[serde(rename = "abilities-v1")]
    pub abilities: Vec<PeerAbility>,
    #[serde(rename = "hints-v1")]
    pub hints: Vec<ConnectionHint>,
}

impl TransitPayload {
    pub fn new(abilities: Vec<Ability>, hints: Vec<ConnectionHint>) -> Self {
        TransitPayload {
            abilities: abilities
                .into_iter()
                .map(|ability| PeerAbility { ability })
                .collect(),
            hints,
        }
    }

    /// The hints list is a set on the wire: drop duplicates and impose the
    /// storage order, keeping the first occurrence of equal entries.
    pub fn normalized(mut self) -> Self {
        let mut deduped: Vec<ConnectionHint> = Vec::with_capacity(self.hints.len());
        for hint in self.hints.drain(..) {
            if !deduped.contains(&hint) {
                deduped.push(hint);
            }
        }
        deduped.sort_by(ConnectionHint::storage_order);
        self.hints = deduped;
        self
    }

    pub fn has_ability(&self, ability: Ability) -> bool {
        self.abilities.iter().any(|a| a.ability == ability)
    }
}

/// A message on the wormhole mailbox channel, wire-encoded as a single-key
/// JSON object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitMsg {
    Transit(TransitPayload),
    Answer(Answer),
    Error(String),
}

/// Acknowledgement of an offer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Answer {
    FileAck(String),
    MessageAck(String),
}

/// Mode string for directory offers.
pub const ZIPFILE_DEFLATED: &str = "zipfile/deflated";

/// What the sender proposes to transfer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Offer {
    File {
        filename: String,
        filesize: u64,
    },
    Directory {
        mode: String,
        dirname: String,
        zipsize: u64,
        numbytes: u64,
        numfiles: u64,
    },
    Message(String),
}

/// Final acknowledgement, sent as an encrypted record at nonce 0 after the
/// last file byte.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitAck {
    pub ack: String,
    pub sha256: String,
}

pub fn encode_msg(msg: &TransitMsg) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(msg)?)
}

pub fn decode_msg(raw: &[u8]) -> Result<TransitMsg> {
    Ok(serde_json::from_slice(raw)?)
}
