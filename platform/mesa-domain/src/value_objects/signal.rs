use crate::value_objects::side::Side;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    Entry,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub side: Side,
    pub reason: String,
}

impl Signal {
    pub fn entry(side: Side, reason: impl Into<String>) -> Self {
        Self {
            kind: SignalKind::Entry,
            side,
            reason: reason.into(),
        }
    }

    pub fn exit(side: Side, reason: impl Into<String>) -> Self {
        Self {
            kind: SignalKind::Exit,
            side,
            reason: reason.into(),
        }
    }
}
