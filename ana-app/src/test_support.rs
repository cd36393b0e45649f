//! In-memory doubles for the pipeline's collaborator traits.

use crate::buffer::{BurstSink, ConsolidatedBurst};
use crate::escalation::EscalationNotifier;
use crate::intent::{ClassifiedIntent, Classifier, Confidence, Intent};
use crate::llm_backends::Responder;
use crate::persistence::ExchangeStore;
use crate::router::Branch;
use ana_channels::{OutboundMessage, Transport, UserKey};
use ana_llm::{ChatMessage, Role};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Default)]
pub struct RecordingSink {
    bursts: Mutex<Vec<ConsolidatedBurst>>,
}

impl RecordingSink {
    pub fn bursts(&self) -> Vec<ConsolidatedBurst> {
        self.bursts.lock().unwrap().clone()
    }
}

#[async_trait]
impl BurstSink for RecordingSink {
    async fn submit(&self, burst: ConsolidatedBurst) {
        self.bursts.lock().unwrap().push(burst);
    }
}

pub struct StubClassifier {
    result: Option<ClassifiedIntent>,
    calls: AtomicUsize,
}

impl StubClassifier {
    pub fn with_intent(intent: Intent) -> Self {
        Self {
            result: Some(ClassifiedIntent {
                intent,
                confidence: Confidence::High,
                entities: serde_json::Map::new(),
            }),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            result: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for StubClassifier {
    async fn classify(&self, _text: &str) -> Result<ClassifiedIntent> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result
            .clone()
            .ok_or_else(|| anyhow!("classifier unavailable"))
    }
}

pub struct StubResponder {
    reply: Option<String>,
    calls: AtomicUsize,
}

impl StubResponder {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Responder for StubResponder {
    async fn respond(
        &self,
        _branch: Branch,
        _user_key: &UserKey,
        _display_name: &str,
        _message: &str,
        _history: &[ChatMessage],
    ) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reply
            .clone()
            .ok_or_else(|| anyhow!("responder unavailable"))
    }
}

/// Captures every `(address, content)` pair sent through the transport.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn transport_id(&self) -> &str {
        "recording"
    }

    async fn send(&self, address: &str, message: OutboundMessage) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((address.to_string(), message.content));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    calls: AtomicUsize,
    fail_next: AtomicBool,
}

impl RecordingNotifier {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl EscalationNotifier for RecordingNotifier {
    async fn notify_human(
        &self,
        _user_key: &UserKey,
        _display_name: &str,
        _last_message: &str,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("broker unreachable"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StoredExchange {
    pub user_key: UserKey,
    pub role: Role,
    pub content: String,
    pub intent: Intent,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
pub struct RecordingStore {
    rows: Mutex<Vec<StoredExchange>>,
}

impl RecordingStore {
    pub fn rows(&self) -> Vec<StoredExchange> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExchangeStore for RecordingStore {
    async fn append_exchange(
        &self,
        user_key: &UserKey,
        role: Role,
        content: &str,
        intent: Intent,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        self.rows.lock().unwrap().push(StoredExchange {
            user_key: user_key.clone(),
            role,
            content: content.to_string(),
            intent,
            timestamp,
        });
        Ok(())
    }
}
