use crate::traits::Transport;
use crate::types::OutboundMessage;
use anyhow::{Result, anyhow};
use reqwest::Url;

const SEND_ATTEMPTS: usize = 2;

/// WhatsApp adapter backed by an Evolution API instance.
///
/// Sends go through `POST {api_url}/message/sendText/{instance}` with the
/// instance API key in the `apikey` header. Inbound events arrive via the
/// webhook route wired in ana-app.
#[derive(Clone)]
pub struct EvolutionAdapter {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    instance: String,
}

impl EvolutionAdapter {
    pub fn new(api_url: &str, api_key: &str, instance: &str) -> Result<Self> {
        let api_url = api_url.trim().trim_end_matches('/');
        if api_url.is_empty() {
            return Err(anyhow!("evolution api url is required"));
        }
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(anyhow!("evolution api key is required"));
        }
        let instance = instance.trim();
        if instance.is_empty() {
            return Err(anyhow!("evolution instance name is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            instance: instance.to_string(),
        })
    }

    fn send_text_url(&self) -> Result<Url> {
        Url::parse(&format!(
            "{}/message/sendText/{}",
            self.api_url, self.instance
        ))
        .map_err(|e| anyhow!("invalid evolution send URL: {e}"))
    }

    async fn send_once(&self, url: Url, address: &str, text: &str) -> Result<()> {
        let payload = serde_json::json!({
            "number": address,
            "text": text,
        });
        let response = self
            .http
            .post(url)
            .header("apikey", &self.api_key)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "evolution send failed: status={} body={}",
                status,
                body
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for EvolutionAdapter {
    fn transport_id(&self) -> &str {
        "evolution"
    }

    async fn send(&self, address: &str, message: OutboundMessage) -> Result<()> {
        let address = address.trim();
        if address.is_empty() {
            return Err(anyhow!("recipient address is required"));
        }
        let text = message.content.trim();
        if text.is_empty() {
            return Err(anyhow!("message content is empty"));
        }

        let url = self.send_text_url()?;
        let mut last_error = None;
        for attempt in 1..=SEND_ATTEMPTS {
            match self.send_once(url.clone(), address, text).await {
                Ok(()) => {
                    tracing::info!(%address, attempt, "message delivered");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(%address, attempt, error = %e, "send attempt failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!("evolution send failed")))
    }
}
