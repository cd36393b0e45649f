//! LLM-backed collaborators: the intent classifier and the per-branch
//! responder. Both degrade gracefully; neither ever aborts the pipeline.

use crate::intent::{ClassifiedIntent, Classifier, Confidence, Intent};
use crate::router::Branch;
use ana_channels::UserKey;
use ana_llm::{ChatMessage, OpenAiClient};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;

const CLASSIFIER_PROMPT: &str = "\
Você é um classificador de intenções para um assistente imobiliário.\n\
Classifique a mensagem do usuário em UMA das intenções:\n\
  greeting, scheduling, qualification, documentation, human_handoff, unknown\n\
Responda APENAS com JSON válido, sem markdown:\n\
{\"intent\": \"<valor>\", \"confidence\": \"<high|medium|low>\", \"entities\": {}}";

pub struct LlmClassifier {
    llm: OpenAiClient,
}

impl LlmClassifier {
    pub fn new(llm: OpenAiClient) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(&self, text: &str) -> Result<ClassifiedIntent> {
        let messages = vec![
            ChatMessage::system(CLASSIFIER_PROMPT),
            ChatMessage::user(text),
        ];
        let raw = self.llm.chat(&messages).await?;
        Ok(parse_classification(&raw))
    }
}

#[derive(Deserialize)]
struct ClassificationWire {
    #[serde(default)]
    intent: String,
    #[serde(default)]
    confidence: String,
    #[serde(default)]
    entities: serde_json::Map<String, serde_json::Value>,
}

/// Fail-closed parse of the classifier output: malformed JSON or an
/// unrecognized label collapses to `Unknown` with low confidence; the raw
/// label is never propagated.
pub(crate) fn parse_classification(raw: &str) -> ClassifiedIntent {
    let cleaned = strip_code_fences(raw);
    match serde_json::from_str::<ClassificationWire>(cleaned) {
        Ok(wire) => ClassifiedIntent {
            intent: Intent::from_label(&wire.intent),
            confidence: Confidence::from_label(&wire.confidence),
            entities: wire.entities,
        },
        Err(e) => {
            tracing::warn!(error = %e, "malformed classifier output; degrading to unknown");
            ClassifiedIntent::unknown()
        }
    }
}

fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

/// Short persona instructions per conversational branch. The deep product
/// knowledge lives in the model; these only pin tone and stage.
fn branch_prompt(branch: Branch) -> &'static str {
    match branch {
        Branch::Greeting => {
            "Você é Ana, corretora virtual de uma imobiliária. Receba o usuário com \
             calor, apresente-se brevemente e pergunte o que ele procura. Máximo 3 \
             frases curtas, negrito WhatsApp com *texto*."
        }
        Branch::Scheduling => {
            "Você é Ana, corretora virtual. Ajude o usuário a marcar uma visita: \
             confirme imóvel, dia e horário, um dado por vez. Seja objetiva e \
             cordial."
        }
        Branch::Qualification => {
            "Você é Ana, corretora virtual. Descubra o perfil do usuário de forma \
             progressiva: tipo de imóvel, região, faixa de preço, prazo. Uma \
             pergunta por mensagem."
        }
        Branch::Documentation => {
            "Você é Ana, corretora virtual. Oriente o usuário sobre documentos, \
             contrato e escritura com linguagem simples, sem jargão jurídico."
        }
        Branch::Unknown => {
            "Você é Ana, corretora virtual de uma imobiliária. A mensagem não se \
             encaixa em nenhuma etapa conhecida; responda com gentileza e traga a \
             conversa de volta para como você pode ajudar com imóveis."
        }
    }
}

/// Responder collaborator: one call per handler invocation, with that
/// branch's rolling history as context.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(
        &self,
        branch: Branch,
        user_key: &UserKey,
        display_name: &str,
        message: &str,
        history: &[ChatMessage],
    ) -> Result<String>;
}

pub struct LlmResponder {
    llm: OpenAiClient,
}

impl LlmResponder {
    pub fn new(llm: OpenAiClient) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Responder for LlmResponder {
    async fn respond(
        &self,
        branch: Branch,
        user_key: &UserKey,
        display_name: &str,
        message: &str,
        history: &[ChatMessage],
    ) -> Result<String> {
        let mut system = String::new();
        if !display_name.trim().is_empty() {
            system.push_str(&format!("Nome do usuário: {}\n", display_name.trim()));
        }
        system.push_str(branch_prompt(branch));

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(system));
        messages.extend_from_slice(history);
        messages.push(ChatMessage::user(message));

        let response = self.llm.chat(&messages).await?;
        if response.trim().is_empty() {
            return Err(anyhow!("responder returned an empty message"));
        }
        tracing::info!(%branch, user_key = %user_key, "branch responder replied");
        Ok(response)
    }
}
