//! Change classification between a stored snapshot and a freshly fetched one.
//!
//! Classification compares the three hash tiers produced by
//! [`crate::hashing`], from loosest to strictest:
//!
//! | Differs at       | State                         | Persisted when                 |
//! |------------------|-------------------------------|--------------------------------|
//! | fingerprint      | `SubstantiveChange`           | always                         |
//! | structural only  | `CosmeticChange` (structural) | `persist_on_cosmetic` or force |
//! | content only     | `CosmeticChange` (content)    | force                          |
//! | nothing          | `Unchanged`                   | never                          |
//!
//! With no stored snapshot the state is `NoHistory` and the new snapshot is
//! always persisted.
//!
//! [`evaluate`] is pure; callers decide what to do with the [`Decision`].

use serde::{Deserialize, Serialize};

use crate::models::Fingerprint;

/// Outcome of comparing a new fetch against the current snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeState {
    NoHistory,
    Unchanged,
    CosmeticChange,
    SubstantiveChange,
}

impl ChangeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeState::NoHistory => "no_history",
            ChangeState::Unchanged => "unchanged",
            ChangeState::CosmeticChange => "cosmetic_change",
            ChangeState::SubstantiveChange => "substantive_change",
        }
    }
}

/// The loosest hash tier at which two texts differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Content,
    Structural,
    Fingerprint,
}

/// Persistence policy knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub persist_on_cosmetic: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            persist_on_cosmetic: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub state: ChangeState,
    pub tier: Option<Tier>,
    pub persist: bool,
}

/// Classify `new` against `current` and decide whether to store it.
pub fn evaluate(
    current: Option<&Fingerprint>,
    new: &Fingerprint,
    force: bool,
    policy: Policy,
) -> Decision {
    let Some(current) = current else {
        return Decision {
            state: ChangeState::NoHistory,
            tier: None,
            persist: true,
        };
    };

    if current.fingerprint_hash != new.fingerprint_hash {
        Decision {
            state: ChangeState::SubstantiveChange,
            tier: Some(Tier::Fingerprint),
            persist: true,
        }
    } else if current.structural_hash != new.structural_hash {
        Decision {
            state: ChangeState::CosmeticChange,
            tier: Some(Tier::Structural),
            persist: policy.persist_on_cosmetic || force,
        }
    } else if current.content_hash != new.content_hash {
        Decision {
            state: ChangeState::CosmeticChange,
            tier: Some(Tier::Content),
            persist: force,
        }
    } else {
        Decision {
            state: ChangeState::Unchanged,
            tier: None,
            persist: false,
        }
    }
}
