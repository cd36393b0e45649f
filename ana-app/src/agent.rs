//! One router traversal per consolidated burst: classify (cache first),
//! route through the transition table, run exactly one handler, finalize.
//! The handler stage is the only stage allowed to suspend on collaborators.

use crate::buffer::{BurstSink, ConsolidatedBurst};
use crate::escalation::EscalationNotifier;
use crate::finalizer::{Finalizer, TECH_APOLOGY};
use crate::intent::{ClassifiedIntent, Classifier, IntentCache};
use crate::llm_backends::Responder;
use crate::memory::SessionMemory;
use crate::persistence::ExchangeStore;
use crate::router::{AgentState, Branch, HandlerState, evaluate_escalation, handler_for};
use ana_channels::{OutboundMessage, Transport, UserKey};
use ana_llm::Role;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub struct Agent {
    classifier: Arc<dyn Classifier>,
    responder: Arc<dyn Responder>,
    notifier: Arc<dyn EscalationNotifier>,
    transport: Arc<dyn Transport>,
    intents: Arc<IntentCache>,
    memory: Arc<SessionMemory>,
    finalizer: Finalizer,
    escalation_triggers: Vec<String>,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        classifier: Arc<dyn Classifier>,
        responder: Arc<dyn Responder>,
        notifier: Arc<dyn EscalationNotifier>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ExchangeStore>,
        intents: Arc<IntentCache>,
        memory: Arc<SessionMemory>,
        escalation_triggers: Vec<String>,
    ) -> Self {
        let finalizer = Finalizer::new(
            intents.clone(),
            store,
            memory.clone(),
            transport.clone(),
        );
        Self {
            classifier,
            responder,
            notifier,
            transport,
            intents,
            memory,
            finalizer,
            escalation_triggers,
        }
    }

    async fn run(&self, burst: ConsolidatedBurst) -> Result<()> {
        let mut state = AgentState::from_burst(&burst)?;
        state.intent = self
            .classify_with_cache(&state.user_key, &state.message)
            .await;

        let mut node = handler_for(state.intent.intent);
        tracing::info!(
            user_key = %state.user_key,
            intent = %state.intent.intent,
            handler = ?node,
            fragment_count = burst.fragment_count,
            "routing consolidated burst"
        );

        if node == HandlerState::EscalationCheck {
            state.should_escalate = evaluate_escalation(
                state.intent.intent,
                &state.message,
                &self.escalation_triggers,
            );
            node = if state.should_escalate {
                HandlerState::Escalate
            } else {
                HandlerState::Unknown
            };
        }

        match node {
            HandlerState::Escalate => self.handle_escalation(&mut state).await,
            other => {
                // branch() is Some for every state reachable here.
                let branch = other.branch().unwrap_or(Branch::Unknown);
                self.handle_branch(branch, &mut state).await;
            }
        }

        self.finalizer.run(state).await;
        Ok(())
    }

    /// Consults the short-TTL memo before paying for a classifier call.
    /// Classification never fails upward: collaborator errors degrade to
    /// `Unknown` with low confidence and are not cached.
    async fn classify_with_cache(&self, key: &UserKey, text: &str) -> ClassifiedIntent {
        if let Some(hit) = self.intents.get(key) {
            tracing::debug!(user_key = %key, intent = %hit.intent, "intent served from cache");
            return hit;
        }
        match self.classifier.classify(text).await {
            Ok(classified) => {
                self.intents.put(key.clone(), classified.clone());
                tracing::info!(
                    user_key = %key,
                    intent = %classified.intent,
                    confidence = ?classified.confidence,
                    "intent classified"
                );
                classified
            }
            Err(e) => {
                tracing::error!(user_key = %key, error = %e, "classification failed; degrading to unknown");
                ClassifiedIntent::unknown()
            }
        }
    }

    async fn handle_branch(&self, branch: Branch, state: &mut AgentState) {
        let history = self.memory.branch_history(&state.user_key, branch);
        match self
            .responder
            .respond(
                branch,
                &state.user_key,
                &state.display_name,
                &state.message,
                &history,
            )
            .await
        {
            Ok(text) if !text.trim().is_empty() => {
                self.memory
                    .push_branch(&state.user_key, branch, Role::User, &state.message);
                self.memory
                    .push_branch(&state.user_key, branch, Role::Assistant, &text);
                state.response = Some(text);
            }
            Ok(_) => {
                tracing::warn!(
                    user_key = %state.user_key,
                    %branch,
                    "responder returned an empty message; finalizer will substitute"
                );
            }
            Err(e) => {
                tracing::warn!(
                    user_key = %state.user_key,
                    %branch,
                    error = %e,
                    "handler failed; finalizer will substitute"
                );
            }
        }
    }

    async fn handle_escalation(&self, state: &mut AgentState) {
        // Fire-and-forget: a notification failure is logged, never retried,
        // and never blocks the user-facing reply.
        if let Err(e) = self
            .notifier
            .notify_human(&state.user_key, &state.display_name, &state.message)
            .await
        {
            tracing::error!(user_key = %state.user_key, error = %e, "human notification failed");
        }
        state.response = Some(handoff_response(state.first_name()));
    }
}

fn handoff_response(first_name: Option<&str>) -> String {
    let name_txt = first_name
        .map(|n| format!(", {n}"))
        .unwrap_or_default();
    format!(
        "Claro{name_txt}! Vou chamar um dos nossos corretores agora. 🙏 \
         Em breve alguém da equipe vai entrar em contato com você. Obrigada pela paciência!"
    )
}

#[async_trait]
impl BurstSink for Agent {
    async fn submit(&self, burst: ConsolidatedBurst) {
        let user_key = burst.user_key.clone();
        let address = burst.transport_address.clone();
        if let Err(e) = self.run(burst).await {
            // Catastrophic path: the traversal never reached finalization.
            // Minimal guaranteed cleanup plus a user acknowledgment.
            tracing::error!(
                user_key = %user_key,
                error = %e,
                "pipeline failed before finalization; performing minimal cleanup"
            );
            self.intents.invalidate(&user_key);
            if !address.trim().is_empty() {
                if let Err(send_err) = self
                    .transport
                    .send(&address, OutboundMessage::text(TECH_APOLOGY))
                    .await
                {
                    tracing::error!(
                        user_key = %user_key,
                        error = %send_err,
                        "failed to deliver technical apology"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MessageBuffer;
    use crate::config::BranchMemoryConfig;
    use crate::finalizer::FALLBACK_RESPONSE;
    use crate::intent::{Confidence, Intent};
    use crate::test_support::{
        RecordingNotifier, RecordingStore, RecordingTransport, StubClassifier, StubResponder,
    };
    use ana_channels::{InboundMessage, MessageId};
    use chrono::Utc;
    use std::collections::HashMap;
    use std::time::Duration;

    struct Harness {
        agent: Arc<Agent>,
        classifier: Arc<StubClassifier>,
        responder: Arc<StubResponder>,
        notifier: Arc<RecordingNotifier>,
        transport: Arc<RecordingTransport>,
        store: Arc<RecordingStore>,
        intents: Arc<IntentCache>,
    }

    fn harness(classifier: StubClassifier, responder: StubResponder) -> Harness {
        let classifier = Arc::new(classifier);
        let responder = Arc::new(responder);
        let notifier = Arc::new(RecordingNotifier::default());
        let transport = Arc::new(RecordingTransport::default());
        let store = Arc::new(RecordingStore::default());
        let intents = Arc::new(IntentCache::new(Duration::from_secs(60)));
        let memory = Arc::new(SessionMemory::new(
            &HashMap::<Branch, BranchMemoryConfig>::new(),
            Duration::from_secs(1800),
            20,
        ));
        let agent = Arc::new(Agent::new(
            classifier.clone(),
            responder.clone(),
            notifier.clone(),
            transport.clone(),
            store.clone(),
            intents.clone(),
            memory,
            vec!["urgente".to_string(), "corretor".to_string()],
        ));
        Harness {
            agent,
            classifier,
            responder,
            notifier,
            transport,
            store,
            intents,
        }
    }

    fn burst(content: &str) -> ConsolidatedBurst {
        ConsolidatedBurst {
            user_key: UserKey::new("5521999999999"),
            transport_address: "5521999999999@s.whatsapp.net".to_string(),
            display_name: "Maria Silva".to_string(),
            content: content.to_string(),
            trigger_message_id: MessageId::new("T1"),
            fragment_count: 1,
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn happy_path_classifies_responds_and_finalizes() {
        let h = harness(
            StubClassifier::with_intent(Intent::Qualification),
            StubResponder::replying("Temos ótimas opções na Tijuca!"),
        );

        h.agent.submit(burst("quero um apartamento de 2 quartos")).await;

        assert_eq!(h.classifier.calls(), 1);
        assert_eq!(h.responder.calls(), 1);
        let sent = h.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "Temos ótimas opções na Tijuca!");
        // One row per direction, tagged with the resolved intent.
        let rows = h.store.rows();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.intent == Intent::Qualification));
        // Finalization wiped the memo even though classification cached it.
        assert!(!h.intents.contains(&UserKey::new("5521999999999")));
    }

    #[tokio::test]
    async fn failing_handler_still_reaches_finalization() {
        let h = harness(
            StubClassifier::with_intent(Intent::Greeting),
            StubResponder::failing(),
        );
        let key = UserKey::new("5521999999999");

        h.agent.submit(burst("oi")).await;

        // Cache invalidated despite the handler error.
        assert!(!h.intents.contains(&key));
        // The uniform fallback was delivered and persisted.
        let sent = h.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, FALLBACK_RESPONSE);
        assert_eq!(h.store.rows().len(), 2);
    }

    #[tokio::test]
    async fn cached_intent_skips_the_classifier() {
        let h = harness(
            StubClassifier::with_intent(Intent::Greeting),
            StubResponder::replying("Oi! Sou a Ana 😊"),
        );
        h.intents.put(
            UserKey::new("5521999999999"),
            ClassifiedIntent {
                intent: Intent::Scheduling,
                confidence: Confidence::High,
                entities: serde_json::Map::new(),
            },
        );

        h.agent.submit(burst("pode ser amanhã às 15h?")).await;

        assert_eq!(h.classifier.calls(), 0);
        assert_eq!(h.responder.calls(), 1);
        assert_eq!(h.store.rows()[0].intent, Intent::Scheduling);
    }

    #[tokio::test]
    async fn classifier_failure_degrades_to_unknown() {
        let h = harness(
            StubClassifier::failing(),
            StubResponder::replying("Posso te ajudar com imóveis!"),
        );

        h.agent.submit(burst("qwyjibo")).await;

        assert_eq!(h.classifier.calls(), 1);
        // Degraded result is not cached; next burst reclassifies anyway.
        assert!(!h.intents.contains(&UserKey::new("5521999999999")));
        assert_eq!(h.store.rows()[0].intent, Intent::Unknown);
        assert_eq!(h.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn handoff_intent_notifies_a_human_and_confirms() {
        let h = harness(
            StubClassifier::with_intent(Intent::HumanHandoff),
            StubResponder::replying("não deveria ser chamado"),
        );

        h.agent.submit(burst("quero falar com um corretor")).await;

        assert_eq!(h.notifier.calls(), 1);
        assert_eq!(h.responder.calls(), 0);
        let sent = h.transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("Claro, Maria!"));
        assert_eq!(h.store.rows().len(), 2);
    }

    #[tokio::test]
    async fn failed_notification_still_answers_the_user() {
        let h = harness(
            StubClassifier::with_intent(Intent::HumanHandoff),
            StubResponder::replying("não deveria ser chamado"),
        );
        h.notifier.fail_next();

        h.agent.submit(burst("urgente, preciso de um humano")).await;

        assert_eq!(h.notifier.calls(), 1);
        let sent = h.transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("corretores"));
    }

    #[tokio::test]
    async fn malformed_burst_takes_the_catastrophic_path() {
        let h = harness(
            StubClassifier::with_intent(Intent::Greeting),
            StubResponder::replying("oi"),
        );
        let key = UserKey::new("");
        h.intents.put(key.clone(), ClassifiedIntent::unknown());

        let mut bad = burst("oi");
        bad.user_key = key.clone();
        h.agent.submit(bad).await;

        // Minimal guaranteed cleanup: cache cleared, apology delivered,
        // nothing persisted.
        assert!(!h.intents.contains(&key));
        let sent = h.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, TECH_APOLOGY);
        assert!(h.store.rows().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_burst_yields_one_cycle() {
        let h = harness(
            StubClassifier::with_intent(Intent::Qualification),
            StubResponder::replying("Na Tijuca temos várias opções! Qual faixa de preço?"),
        );
        let buffer = Arc::new(MessageBuffer::new(
            Duration::from_secs(4),
            Duration::from_secs(5),
            h.agent.clone(),
        ));

        for (offset, (content, id)) in [
            ("Oi", "A"),
            ("Quero saber sobre apartamentos", "B"),
            ("em qual bairro?", "C"),
        ]
        .iter()
        .enumerate()
        {
            if offset > 0 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            buffer.enqueue(InboundMessage {
                user_key: UserKey::new("5521999999999"),
                transport_address: "5521999999999@s.whatsapp.net".to_string(),
                display_name: "Maria Silva".to_string(),
                content: content.to_string(),
                message_id: MessageId::new(*id),
                received_at: Utc::now(),
            });
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        // Exactly one classification, one handler invocation, one finalize,
        // one outbound send, for the whole burst.
        assert_eq!(h.classifier.calls(), 1);
        assert_eq!(h.responder.calls(), 1);
        assert_eq!(h.transport.sent().len(), 1);
        let rows = h.store.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0].content,
            "Oi | Quero saber sobre apartamentos | em qual bairro?"
        );
    }
}
