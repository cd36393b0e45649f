//! Deterministic intent-routing state machine.
//!
//! Topology is fixed: `Classifying` fans out to one handler per intent label,
//! `EscalationCheck` resolves to `Escalate` or `Unknown`, and every handler
//! has exactly one outgoing edge into `Finalizing`. No handler can
//! short-circuit past finalization.

use crate::buffer::ConsolidatedBurst;
use crate::intent::{ClassifiedIntent, Intent};
use ana_channels::{MessageId, UserKey};
use anyhow::{Result, anyhow};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

/// Handler stage reached from `Classifying`. `EscalationCheck` is the only
/// state with a second fan-out; everything else converges on `Finalizing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Greeting,
    Scheduling,
    Qualification,
    Documentation,
    EscalationCheck,
    Escalate,
    Unknown,
}

impl HandlerState {
    /// Conversational branch backing this handler, if it has one.
    pub fn branch(&self) -> Option<Branch> {
        match self {
            HandlerState::Greeting => Some(Branch::Greeting),
            HandlerState::Scheduling => Some(Branch::Scheduling),
            HandlerState::Qualification => Some(Branch::Qualification),
            HandlerState::Documentation => Some(Branch::Documentation),
            HandlerState::Unknown => Some(Branch::Unknown),
            HandlerState::EscalationCheck | HandlerState::Escalate => None,
        }
    }
}

/// Total label-to-handler transition table. Every intent value maps to
/// exactly one next state; `Unknown` is the single fail-closed target.
pub fn handler_for(intent: Intent) -> HandlerState {
    match intent {
        Intent::Greeting => HandlerState::Greeting,
        Intent::Scheduling => HandlerState::Scheduling,
        Intent::Qualification => HandlerState::Qualification,
        Intent::Documentation => HandlerState::Documentation,
        Intent::HumanHandoff => HandlerState::EscalationCheck,
        Intent::Unknown => HandlerState::Unknown,
    }
}

/// Escalation is a logical OR of two independent signals: the classified
/// label equals the handoff intent, or the raw message contains any
/// configured trigger phrase (case-insensitive substring). Neither signal
/// has priority over the other.
pub fn evaluate_escalation(intent: Intent, message: &str, triggers: &[String]) -> bool {
    let message_lower = message.to_lowercase();
    let trigger_found = triggers
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .any(|t| message_lower.contains(&t));
    intent == Intent::HumanHandoff || trigger_found
}

/// Conversational branches that own rolling history. `Escalate` has no
/// memory of its own, so it is not a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    Greeting,
    Scheduling,
    Qualification,
    Documentation,
    Unknown,
}

impl Branch {
    pub const ALL: [Branch; 5] = [
        Branch::Greeting,
        Branch::Scheduling,
        Branch::Qualification,
        Branch::Documentation,
        Branch::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Branch::Greeting => "greeting",
            Branch::Scheduling => "scheduling",
            Branch::Qualification => "qualification",
            Branch::Documentation => "documentation",
            Branch::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient record threaded through one router traversal. Created at entry,
/// mutated by the active handler, consumed by the finalizer. Never persisted
/// as-is; only derived fields reach durable storage.
#[derive(Debug, Clone)]
pub struct AgentState {
    pub user_key: UserKey,
    pub transport_address: String,
    pub display_name: String,
    pub message: String,
    pub message_fingerprint: String,
    pub trigger_message_id: MessageId,
    pub intent: ClassifiedIntent,
    pub response: Option<String>,
    pub should_escalate: bool,
}

impl AgentState {
    /// Validates the identity fields at the traversal boundary. A burst with
    /// no user key or delivery address cannot be routed or answered.
    pub fn from_burst(burst: &ConsolidatedBurst) -> Result<Self> {
        if burst.user_key.is_empty() {
            return Err(anyhow!("burst has an empty user key"));
        }
        if burst.transport_address.trim().is_empty() {
            return Err(anyhow!(
                "burst for {} has no transport address",
                burst.user_key
            ));
        }
        Ok(Self {
            user_key: burst.user_key.clone(),
            transport_address: burst.transport_address.clone(),
            display_name: burst.display_name.clone(),
            message: burst.content.clone(),
            message_fingerprint: fingerprint(&burst.content),
            trigger_message_id: burst.trigger_message_id.clone(),
            intent: ClassifiedIntent::unknown(),
            response: None,
            should_escalate: false,
        })
    }

    pub fn first_name(&self) -> Option<&str> {
        self.display_name.split_whitespace().next()
    }
}

fn fingerprint(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    to_lower_hex(&hasher.finalize())
}

fn to_lower_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from_digit((byte >> 4) as u32, 16).unwrap_or('0'));
        out.push(char::from_digit((byte & 0x0f) as u32, 16).unwrap_or('0'));
    }
    out
}
