//! Human-handoff notification. Fire-and-forget: a delivery failure is logged
//! and never retried by the pipeline.

use ana_channels::{OutboundMessage, Transport, UserKey};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait EscalationNotifier: Send + Sync {
    async fn notify_human(
        &self,
        user_key: &UserKey,
        display_name: &str,
        last_message: &str,
    ) -> Result<()>;
}

/// Forwards an alert to the on-call broker through the regular transport.
pub struct BrokerNotifier {
    transport: Arc<dyn Transport>,
    human_address: String,
}

impl BrokerNotifier {
    pub fn new(transport: Arc<dyn Transport>, human_address: impl Into<String>) -> Self {
        Self {
            transport,
            human_address: human_address.into(),
        }
    }
}

#[async_trait]
impl EscalationNotifier for BrokerNotifier {
    async fn notify_human(
        &self,
        user_key: &UserKey,
        display_name: &str,
        last_message: &str,
    ) -> Result<()> {
        let alert = format_alert(user_key, display_name, last_message);
        self.transport
            .send(&self.human_address, OutboundMessage::text(alert))
            .await?;
        tracing::info!(
            user_key = %user_key,
            human_address = %self.human_address,
            "escalation forwarded to human broker"
        );
        Ok(())
    }
}

fn format_alert(user_key: &UserKey, display_name: &str, last_message: &str) -> String {
    let who = if display_name.trim().is_empty() {
        user_key.as_str().to_string()
    } else {
        format!("{} ({user_key})", display_name.trim())
    };
    let context: String = last_message.chars().take(150).collect();
    format!(
        "📲 *Novo atendimento necessário*\nCliente: {who}\nÚltima mensagem: {context}"
    )
}
