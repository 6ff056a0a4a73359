//! Guidance generation: prompt assembly, token budget, tag extraction, fail-safe.

use crate::config::LlmSettings;
use crate::error::{VoiceError, VoiceResult};
use crate::history::{ConversationHistory, ConversationTurn};
use crate::llm::{CompletionRequest, LanguageModel};
use crate::tags::{parse_reply, Urgency};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Spoken when the language model cannot be reached.
pub const FALLBACK_TEXT: &str =
    "Emergency system error. Please call your supervisor at extension 9999 immediately.";
pub const FALLBACK_SOURCE: &str = "Emergency Procedures Manual";

const BASE_PREAMBLE: &str = "You are Aurora, a voice assistant for industrial workers. \
Your answers are spoken aloud, so keep them short and clear. \
Use short sentences and one instruction at a time. Avoid jargon, lists and markdown. \
For emergencies give the immediate action first, then the safety step, then who to alert, \
and ask the worker to confirm they understood. \
When you mention equipment such as a first aid kit, say exactly where it is.";

const TAG_INSTRUCTIONS: &str = "After your answer, classify the urgency and name your sources \
using exactly this format at the end:\n\
[URGENCY: critical|urgent|normal|assistive]\n\
[SOURCES: source one, source two]\n\
critical: life-threatening, immediate danger (gas leaks, fires, explosions, severe injuries).\n\
urgent: serious but not immediately life-threatening (injuries, equipment failures, hazards).\n\
normal: routine work situations and status questions.\n\
assistive: how-to questions, procedures and troubleshooting.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedResponse {
    pub text: String,
    pub urgency: Urgency,
    pub sources: Vec<String>,
}

impl GeneratedResponse {
    /// Fixed guidance used whenever generation fails.
    pub fn fallback() -> Self {
        Self {
            text: FALLBACK_TEXT.to_string(),
            urgency: Urgency::Critical,
            sources: vec![FALLBACK_SOURCE.to_string()],
        }
    }
}

/// Build the system preamble: base or configured prompt, tag instructions, optional site
/// knowledge loaded from `knowledge_path`.
pub fn build_preamble(settings: &LlmSettings) -> VoiceResult<String> {
    let mut preamble = settings
        .system_prompt
        .clone()
        .unwrap_or_else(|| BASE_PREAMBLE.to_string());

    if let Some(path) = &settings.knowledge_path {
        let knowledge = std::fs::read_to_string(path).map_err(|e| {
            VoiceError::Config(format!("failed to read knowledge file {}: {}", path.display(), e))
        })?;
        let knowledge = knowledge.trim();
        if !knowledge.is_empty() {
            info!(path = %path.display(), chars = knowledge.len(), "📚 Site knowledge loaded");
            preamble.push_str("\n\nSITE INFORMATION:\n");
            preamble.push_str(knowledge);
        }
    }

    preamble.push_str("\n\n");
    preamble.push_str(TAG_INSTRUCTIONS);
    Ok(preamble)
}

pub struct ResponseGenerator {
    model: Arc<dyn LanguageModel>,
    keywords: Vec<String>,
    default_max_tokens: u32,
    urgent_max_tokens: u32,
    temperature: f32,
    timeout: Duration,
}

impl ResponseGenerator {
    pub fn new(model: Arc<dyn LanguageModel>, settings: &LlmSettings) -> Self {
        Self {
            model,
            keywords: settings
                .urgency_keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            default_max_tokens: settings.default_max_tokens,
            urgent_max_tokens: settings.urgent_max_tokens,
            temperature: settings.temperature,
            timeout: Duration::from_millis(settings.timeout_ms),
        }
    }

    /// Whether `input` mentions any urgency keyword. A budget heuristic, not a classifier.
    pub fn is_urgent(&self, input: &str) -> bool {
        let lowered = input.to_lowercase();
        self.keywords.iter().any(|k| lowered.contains(k.as_str()))
    }

    pub fn max_tokens_for(&self, input: &str) -> u32 {
        if self.is_urgent(input) {
            self.urgent_max_tokens
        } else {
            self.default_max_tokens
        }
    }

    /// Generate guidance for `input`. Never fails: model errors and timeouts produce
    /// `GeneratedResponse::fallback()`.
    pub async fn generate(&self, history: &ConversationHistory, input: &str) -> GeneratedResponse {
        let mut messages = history.messages();
        messages.push(ConversationTurn::user(input));
        let request = CompletionRequest {
            messages,
            max_tokens: self.max_tokens_for(input),
            temperature: self.temperature,
        };
        debug!(max_tokens = request.max_tokens, "🧠 Generating response");

        let result = match tokio::time::timeout(self.timeout, self.model.complete(request)).await {
            Ok(r) => r,
            Err(_) => Err(VoiceError::Timeout(self.timeout.as_millis() as u64)),
        };

        match result {
            Ok(raw) => {
                let reply = parse_reply(&raw);
                if reply.text.trim().is_empty() {
                    error!("language model returned only tags, using fallback");
                    return GeneratedResponse::fallback();
                }
                info!(urgency = %reply.urgency, sources = reply.sources.len(), "💬 Response generated");
                GeneratedResponse {
                    text: reply.text,
                    urgency: reply.urgency,
                    sources: reply.sources,
                }
            }
            Err(e) => {
                error!(error = %e, "❌ Language model failed, using fallback");
                GeneratedResponse::fallback()
            }
        }
    }
}
