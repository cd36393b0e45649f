//! Evolution API webhook normalization. Exclusive responsibility: extract the
//! relevant fields from a `messages.upsert` payload and build the normalized
//! inbound message. Zero business logic here.

use ana_channels::{InboundMessage, MessageId, UserKey};
use chrono::Utc;
use serde_json::Value;

/// Returns `None` for payloads the agent must ignore: non-message events,
/// the bot's own messages, group chats, and empty bodies.
pub fn normalize(body: &Value) -> Option<InboundMessage> {
    if body.get("event").and_then(Value::as_str) != Some("messages.upsert") {
        return None;
    }

    let data = body.get("data")?;
    let key = data.get("key")?;

    if key.get("fromMe").and_then(Value::as_bool) == Some(true) {
        return None;
    }

    let raw_jid = key.get("remoteJid").and_then(Value::as_str).unwrap_or("");
    let alt_jid = key
        .get("remoteJidAlt")
        .and_then(Value::as_str)
        .unwrap_or("");

    if raw_jid.ends_with("@g.us") {
        return None;
    }

    // `@lid` is an internal id; the real number lives in remoteJidAlt.
    let transport_address = if raw_jid.ends_with("@lid") {
        alt_jid
    } else {
        raw_jid
    };

    let digits: String = transport_address
        .split('@')
        .next()
        .unwrap_or("")
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return None;
    }

    let message = data.get("message")?;
    let content = message
        .get("conversation")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| {
            message
                .get("extendedTextMessage")
                .and_then(|m| m.get("text"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
        })?;

    let display_name = data
        .get("pushName")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let message_id = key
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    Some(InboundMessage {
        user_key: UserKey::new(digits),
        transport_address: transport_address.to_string(),
        display_name,
        content: content.to_string(),
        message_id: MessageId::new(message_id),
        received_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(jid: &str, content: &str) -> Value {
        json!({
            "event": "messages.upsert",
            "data": {
                "key": {
                    "remoteJid": jid,
                    "fromMe": false,
                    "id": "3EB0C8"
                },
                "pushName": "Maria Silva",
                "message": { "conversation": content }
            }
        })
    }

    #[test]
    fn extracts_a_plain_conversation_message() {
        let inbound = normalize(&payload("5521999999999@s.whatsapp.net", "Oi"))
            .expect("normalized message");
        assert_eq!(inbound.user_key.as_str(), "5521999999999");
        assert_eq!(inbound.transport_address, "5521999999999@s.whatsapp.net");
        assert_eq!(inbound.display_name, "Maria Silva");
        assert_eq!(inbound.content, "Oi");
        assert_eq!(inbound.message_id.as_str(), "3EB0C8");
    }

    #[test]
    fn resolves_lid_addresses_through_the_alt_jid() {
        let body = json!({
            "event": "messages.upsert",
            "data": {
                "key": {
                    "remoteJid": "123456789@lid",
                    "remoteJidAlt": "5521999999999@s.whatsapp.net",
                    "fromMe": false,
                    "id": "X1"
                },
                "message": { "conversation": "oi" }
            }
        });
        let inbound = normalize(&body).expect("normalized message");
        assert_eq!(inbound.user_key.as_str(), "5521999999999");
        assert_eq!(inbound.transport_address, "5521999999999@s.whatsapp.net");
    }

    #[test]
    fn reads_extended_text_when_conversation_is_absent() {
        let body = json!({
            "event": "messages.upsert",
            "data": {
                "key": { "remoteJid": "5521999999999@s.whatsapp.net", "fromMe": false },
                "message": { "extendedTextMessage": { "text": "quero agendar" } }
            }
        });
        let inbound = normalize(&body).expect("normalized message");
        assert_eq!(inbound.content, "quero agendar");
        assert!(inbound.message_id.is_empty());
    }

    #[test]
    fn ignores_other_events_own_messages_and_groups() {
        let mut own = payload("5521999999999@s.whatsapp.net", "oi");
        own["data"]["key"]["fromMe"] = json!(true);
        assert!(normalize(&own).is_none());

        assert!(normalize(&payload("120363000000000000@g.us", "oi")).is_none());

        let mut other_event = payload("5521999999999@s.whatsapp.net", "oi");
        other_event["event"] = json!("connection.update");
        assert!(normalize(&other_event).is_none());
    }

    #[test]
    fn ignores_payloads_without_text_or_digits() {
        let body = json!({
            "event": "messages.upsert",
            "data": {
                "key": { "remoteJid": "5521999999999@s.whatsapp.net", "fromMe": false },
                "message": { "imageMessage": {} }
            }
        });
        assert!(normalize(&body).is_none());
        assert!(normalize(&payload("status@broadcast", "oi")).is_none());
    }
}
