//! Mandatory finalization, reached from every handler. Four steps in fixed
//! order, each fault-isolated: cache invalidation, durable persistence,
//! rolling-history update, outbound delivery. Cache invalidation is the one
//! must-not-skip step; nothing earlier in the pipeline may prevent it.

use crate::intent::IntentCache;
use crate::memory::SessionMemory;
use crate::persistence::ExchangeStore;
use crate::router::AgentState;
use ana_channels::{OutboundMessage, Transport};
use ana_llm::Role;
use chrono::Utc;
use std::sync::Arc;

/// Substituted when a handler produced nothing.
pub const FALLBACK_RESPONSE: &str =
    "Hmm, não consegui processar sua mensagem agora. Pode tentar novamente? 😊";

/// Sent by the catastrophic-failure path when the pipeline never reached
/// finalization.
pub const TECH_APOLOGY: &str =
    "Desculpe, tive um problema técnico agora. 😊 Pode tentar novamente em instantes?";

pub struct Finalizer {
    intents: Arc<IntentCache>,
    store: Arc<dyn ExchangeStore>,
    memory: Arc<SessionMemory>,
    transport: Arc<dyn Transport>,
}

impl Finalizer {
    pub fn new(
        intents: Arc<IntentCache>,
        store: Arc<dyn ExchangeStore>,
        memory: Arc<SessionMemory>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            intents,
            store,
            memory,
            transport,
        }
    }

    pub async fn run(&self, mut state: AgentState) {
        let response = state
            .response
            .take()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| {
                tracing::warn!(
                    user_key = %state.user_key,
                    "handler produced no response; substituting fallback"
                );
                FALLBACK_RESPONSE.to_string()
            });
        let intent = state.intent.intent;

        // 1. Invalidate the classification memo so the next burst
        //    reclassifies instead of reusing this exchange's decision.
        self.intents.invalidate(&state.user_key);

        // 2. Durable persistence: one row per direction.
        let now = Utc::now();
        if let Err(e) = self
            .store
            .append_exchange(&state.user_key, Role::User, &state.message, intent, now)
            .await
        {
            tracing::error!(user_key = %state.user_key, error = %e, "failed to persist inbound exchange");
        }
        if let Err(e) = self
            .store
            .append_exchange(&state.user_key, Role::Assistant, &response, intent, now)
            .await
        {
            tracing::error!(user_key = %state.user_key, error = %e, "failed to persist outbound exchange");
        }

        // 3. Rolling session history.
        self.memory
            .push_session(&state.user_key, Role::User, &state.message);
        self.memory
            .push_session(&state.user_key, Role::Assistant, &response);

        // 4. Delivery. The transport owns its retry budget.
        match self
            .transport
            .send(&state.transport_address, OutboundMessage::text(response))
            .await
        {
            Ok(()) => tracing::info!(
                user_key = %state.user_key,
                intent = %intent,
                should_escalate = state.should_escalate,
                "cycle completed"
            ),
            Err(e) => tracing::error!(
                user_key = %state.user_key,
                error = %e,
                "failed to deliver response"
            ),
        }
    }
}
