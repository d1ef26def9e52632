use std::collections::HashMap;

use async_trait::async_trait;
#[allow(deprecated)]
use rig::client::completion::CompletionModelHandle;
use rig::completion::{self, CompletionModel, CompletionRequest, Message};
use rig::message::{AssistantContent, Reasoning, Text, ToolResult, ToolResultContent, UserContent};
use rig::OneOrMany;
use tracing::debug;

use super::{
    ChatMessage, ChatRequest, FinishReason, LLMProvider, LLMResponse, ProviderError,
    ToolCallRequest, ToolDefinition, Usage,
};

/// Phrases upstream APIs use when a request is declined on policy grounds.
const POLICY_MARKERS: &[&str] = &[
    "content_policy",
    "content policy",
    "content_filter",
    "safety system",
    "refusal",
];

/// [`LLMProvider`] backed by a rig completion model.
///
/// Additional models may be registered by name; a request naming an unknown
/// model falls back to the default one.
#[allow(deprecated)]
pub struct RigProvider {
    default_name: String,
    default_model: CompletionModelHandle<'static>,
    extra: HashMap<String, CompletionModelHandle<'static>>,
}

#[allow(deprecated)]
impl RigProvider {
    pub fn new(model_name: impl Into<String>, model: CompletionModelHandle<'static>) -> Self {
        Self {
            default_name: model_name.into(),
            default_model: model,
            extra: HashMap::new(),
        }
    }

    pub fn with_model(mut self, name: impl Into<String>, model: CompletionModelHandle<'static>) -> Self {
        self.extra.insert(name.into(), model);
        self
    }

    fn resolve(&self, requested: Option<&str>) -> &CompletionModelHandle<'static> {
        match requested {
            Some(name) if name != self.default_name => match self.extra.get(name) {
                Some(model) => model,
                None => {
                    debug!("Model '{name}' not registered; using {}", self.default_name);
                    &self.default_model
                }
            },
            _ => &self.default_model,
        }
    }
}

/// Split our message list into rig's preamble + history shape. Consecutive
/// tool results collapse into a single user turn, and each result carries
/// the `call_id` of the call it answers.
fn to_rig_history(messages: &[ChatMessage]) -> (Option<String>, Vec<Message>) {
    let mut preamble: Vec<&str> = Vec::new();
    let mut history: Vec<Message> = Vec::new();
    let mut pending_results: Vec<UserContent> = Vec::new();
    let mut call_ids: HashMap<&str, &str> = HashMap::new();

    let flush = |pending: &mut Vec<UserContent>, history: &mut Vec<Message>| {
        if let Ok(content) = OneOrMany::many(std::mem::take(pending)) {
            history.push(Message::User { content });
        }
    };

    for msg in messages {
        match msg {
            ChatMessage::Tool {
                tool_call_id,
                content,
                ..
            } => {
                pending_results.push(UserContent::ToolResult(ToolResult {
                    id: tool_call_id.clone(),
                    call_id: call_ids.get(tool_call_id.as_str()).map(|c| c.to_string()),
                    content: OneOrMany::one(ToolResultContent::Text(Text {
                        text: content.clone(),
                    })),
                }));
                continue;
            }
            _ => flush(&mut pending_results, &mut history),
        }

        match msg {
            ChatMessage::System { content } => preamble.push(content),
            ChatMessage::User { content } => history.push(Message::User {
                content: OneOrMany::one(UserContent::Text(Text {
                    text: content.clone(),
                })),
            }),
            ChatMessage::Assistant {
                content,
                tool_calls,
                reasoning,
            } => {
                let mut parts: Vec<AssistantContent> = Vec::new();
                if let Some(r) = reasoning.as_deref().filter(|r| !r.is_empty()) {
                    parts.push(AssistantContent::Reasoning(Reasoning::new(r)));
                }
                if let Some(text) = content.as_deref().filter(|t| !t.is_empty()) {
                    parts.push(AssistantContent::Text(Text {
                        text: text.to_string(),
                    }));
                }
                for call in tool_calls {
                    let part = match &call.call_id {
                        Some(call_id) => {
                            call_ids.insert(&call.id, call_id);
                            AssistantContent::tool_call_with_call_id(
                                call.id.clone(),
                                call_id.clone(),
                                call.name.clone(),
                                call.arguments.clone(),
                            )
                        }
                        None => AssistantContent::tool_call(
                            call.id.clone(),
                            call.name.clone(),
                            call.arguments.clone(),
                        ),
                    };
                    parts.push(part);
                }
                if let Ok(content) = OneOrMany::many(parts) {
                    history.push(Message::Assistant { id: None, content });
                }
            }
            ChatMessage::Tool { .. } => {}
        }
    }
    flush(&mut pending_results, &mut history);

    let preamble = if preamble.is_empty() {
        None
    } else {
        Some(preamble.join("\n\n"))
    };
    (preamble, history)
}

fn classify(err: completion::CompletionError) -> ProviderError {
    let text = err.to_string();
    let lowered = text.to_lowercase();
    if POLICY_MARKERS.iter().any(|m| lowered.contains(m)) {
        ProviderError::ContentPolicy(text)
    } else {
        ProviderError::Transport(format!("LLM completion error: {text}"))
    }
}

#[allow(deprecated)]
#[async_trait]
impl LLMProvider for RigProvider {
    async fn chat(&self, request: ChatRequest) -> Result<LLMResponse, ProviderError> {
        let (preamble, history) = to_rig_history(&request.messages);
        let chat_history = OneOrMany::many(history)
            .map_err(|_| ProviderError::InvalidResponse("request has no conversation turns".into()))?;

        let tools = request
            .tools
            .iter()
            .map(|t: &ToolDefinition| completion::ToolDefinition {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            })
            .collect();

        let rig_request = CompletionRequest {
            preamble,
            chat_history,
            documents: Vec::new(),
            tools,
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            tool_choice: None,
            additional_params: None,
        };

        let model = self.resolve(request.model.as_deref());
        let response = model.completion(rig_request).await.map_err(classify)?;

        let mut text = String::new();
        let mut reasoning: Vec<String> = Vec::new();
        let mut tool_calls = Vec::new();
        for part in response.choice.iter() {
            match part {
                AssistantContent::Text(t) => text.push_str(&t.text),
                AssistantContent::ToolCall(tc) => tool_calls.push(
                    ToolCallRequest::new(
                        tc.id.clone(),
                        tc.function.name.clone(),
                        tc.function.arguments.clone(),
                    )
                    .with_call_id(tc.call_id.clone()),
                ),
                AssistantContent::Reasoning(r) => reasoning.push(r.reasoning.join(" ")),
                _ => {}
            }
        }

        let finish_reason = if tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        };

        Ok(LLMResponse {
            content: if text.is_empty() { None } else { Some(text) },
            tool_calls,
            finish_reason,
            usage: Usage {
                prompt_tokens: response.usage.input_tokens,
                completion_tokens: response.usage.output_tokens,
                total_tokens: response.usage.total_tokens,
            },
            reasoning: if reasoning.is_empty() {
                None
            } else {
                Some(reasoning.join("\n"))
            },
        })
    }

    fn default_model(&self) -> &str {
        &self.default_name
    }
}
