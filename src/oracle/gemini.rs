//! Gemini-powered decision oracle
//!
//! Translates the conversation into Gemini `contents`, offers the operation
//! catalog as function declarations, and maps function calls back into
//! operation calls.

use super::{DecisionOracle, OracleRequest};
use crate::error::OrchestrationError;
use crate::gemini::{
    GeminiClient, GeminiContent, GeminiFunctionCall, GeminiFunctionDeclaration,
    GeminiFunctionResponse, GeminiPart, GeminiRequest, GeminiResponse, GeminiTool,
    GenerationConfig,
};
use crate::memory::{ConversationMessage, MessageRole};
use crate::models::{Decision, OperationCall};
use crate::tools::OperationSpec;
use crate::Result;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

pub struct GeminiOracle {
    client: GeminiClient,
}

impl GeminiOracle {
    pub fn new(api_key: String, model: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: GeminiClient::new(api_key, model, timeout)?,
        })
    }

    fn build_request(request: &OracleRequest<'_>) -> GeminiRequest {
        let messages: Vec<&ConversationMessage> = request.conversation.messages().collect();

        GeminiRequest {
            contents: to_contents(&messages),
            system_instruction: Some(GeminiContent {
                role: None,
                parts: vec![GeminiPart::Text {
                    text: request.system_instruction.clone(),
                }],
            }),
            tools: to_tools(request.catalog),
            generation_config: GenerationConfig::default(),
        }
    }
}

#[async_trait]
impl DecisionOracle for GeminiOracle {
    async fn decide(&self, request: &OracleRequest<'_>) -> Result<Decision> {
        let gemini_request = Self::build_request(request);
        let response = self.client.generate_content(&gemini_request).await?;

        if let Some(usage) = &response.usage_metadata {
            info!(
                prompt_tokens = usage.prompt_token_count,
                completion_tokens = usage.candidates_token_count,
                "Gemini decision received"
            );
        }

        parse_decision(response)
    }
}

fn to_tools(catalog: &[OperationSpec]) -> Vec<GeminiTool> {
    if catalog.is_empty() {
        return Vec::new();
    }

    vec![GeminiTool {
        function_declarations: catalog
            .iter()
            .map(|spec| GeminiFunctionDeclaration {
                name: spec.name.clone(),
                description: spec.description.clone(),
                parameters: spec.parameters.clone(),
            })
            .collect(),
    }]
}

/// Consecutive operation results become one content block, matching the
/// function calls of the preceding model turn.
fn to_contents(messages: &[&ConversationMessage]) -> Vec<GeminiContent> {
    let mut contents: Vec<GeminiContent> = Vec::with_capacity(messages.len());

    for msg in messages {
        match msg.role {
            MessageRole::User => contents.push(GeminiContent {
                role: Some("user".to_string()),
                parts: vec![GeminiPart::Text {
                    text: msg.content.clone(),
                }],
            }),
            MessageRole::Oracle => {
                let mut parts = Vec::with_capacity(msg.calls.len() + 1);
                if !msg.content.is_empty() {
                    parts.push(GeminiPart::Text {
                        text: msg.content.clone(),
                    });
                }
                parts.extend(msg.calls.iter().map(|call| GeminiPart::FunctionCall {
                    function_call: GeminiFunctionCall {
                        id: Some(call.id.clone()),
                        name: call.name.clone(),
                        args: call.arguments.clone(),
                    },
                }));
                if !parts.is_empty() {
                    contents.push(GeminiContent {
                        role: Some("model".to_string()),
                        parts,
                    });
                }
            }
            MessageRole::Operation => {
                let part = GeminiPart::FunctionResponse {
                    function_response: GeminiFunctionResponse {
                        id: msg.call_id.clone(),
                        name: msg.operation.clone().unwrap_or_default(),
                        response: json!({ "result": msg.content }),
                    },
                };

                let continues_results = contents.last().map_or(false, |last| {
                    last.role.as_deref() == Some("user")
                        && matches!(last.parts.first(), Some(GeminiPart::FunctionResponse { .. }))
                });

                match contents.last_mut() {
                    Some(last) if continues_results => last.parts.push(part),
                    _ => contents.push(GeminiContent {
                        role: Some("user".to_string()),
                        parts: vec![part],
                    }),
                }
            }
        }
    }

    contents
}

/// Map the first candidate into a decision. Missing call ids get fresh ones.
fn parse_decision(response: GeminiResponse) -> Result<Decision> {
    let candidate = response.candidates.into_iter().next().ok_or_else(|| {
        OrchestrationError::LlmError("No candidates in Gemini response".to_string())
    })?;

    let content = candidate.content.ok_or_else(|| {
        OrchestrationError::LlmError(format!(
            "Empty Gemini response (finish reason: {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        ))
    })?;

    let mut texts = Vec::new();
    let mut calls = Vec::new();

    for part in content.parts {
        match part {
            GeminiPart::Text { text } => {
                if !text.trim().is_empty() {
                    texts.push(text);
                }
            }
            GeminiPart::FunctionCall { function_call } => {
                let id = function_call
                    .id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()));
                calls.push(OperationCall::new(id, function_call.name, function_call.args));
            }
            GeminiPart::FunctionResponse { .. } => {}
        }
    }

    if texts.is_empty() && calls.is_empty() {
        return Err(OrchestrationError::LlmError(
            "Gemini returned neither text nor function calls".to_string(),
        ));
    }

    Ok(Decision {
        text: (!texts.is_empty()).then(|| texts.join("\n")),
        calls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ConversationState;

    #[test]
    fn test_contents_pair_calls_with_grouped_results() {
        let mut state = ConversationState::new("s1");
        state.add_user_message("I spent 200 on food");

        let record = OperationCall::new("c1", "record_transaction", json!({"amount": 200}));
        let check = OperationCall::new("c2", "check_budget", json!({}));
        state.add_decision(&Decision::call(vec![record.clone(), check.clone()]));
        state.add_observation(&record, "Transaction recorded").unwrap();
        state.add_observation(&check, "📊 **Budget Status:**").unwrap();
        state.add_decision(&Decision::answer("All set."));

        let messages: Vec<&ConversationMessage> = state.messages().collect();
        let contents = to_contents(&messages);

        assert_eq!(contents.len(), 4);
        assert_eq!(contents[0].role.as_deref(), Some("user"));
        assert_eq!(contents[1].role.as_deref(), Some("model"));
        assert_eq!(contents[1].parts.len(), 2);
        assert_eq!(contents[2].parts.len(), 2);

        match &contents[2].parts[1] {
            GeminiPart::FunctionResponse { function_response } => {
                assert_eq!(function_response.id.as_deref(), Some("c2"));
                assert_eq!(function_response.name, "check_budget");
            }
            other => panic!("expected function response, got {:?}", other),
        }
        assert_eq!(contents[3].role.as_deref(), Some("model"));
    }

    #[test]
    fn test_parse_decision_assigns_missing_ids() {
        let response: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"functionCall": {"name": "record_transaction", "args": {"amount": 200, "category": "food"}}},
                        {"functionCall": {"name": "check_budget", "args": {}}}
                    ]
                },
                "finishReason": "STOP"
            }]
        }))
        .unwrap();

        let decision = parse_decision(response).unwrap();
        assert!(decision.text.is_none());
        assert_eq!(decision.calls.len(), 2);
        assert!(decision.calls[0].id.starts_with("call_"));
        assert_ne!(decision.calls[0].id, decision.calls[1].id);
        assert_eq!(decision.calls[1].name, "check_budget");
    }

    #[test]
    fn test_parse_decision_text_answer_and_empty() {
        let response: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "Your budget is set."}]}}]
        }))
        .unwrap();
        let decision = parse_decision(response).unwrap();
        assert!(decision.is_final());
        assert_eq!(decision.text.as_deref(), Some("Your budget is set."));

        let empty: GeminiResponse = serde_json::from_value(json!({"candidates": []})).unwrap();
        assert!(parse_decision(empty).is_err());

        let blocked: GeminiResponse =
            serde_json::from_value(json!({"candidates": [{"finishReason": "SAFETY"}]})).unwrap();
        assert!(parse_decision(blocked).unwrap_err().to_string().contains("SAFETY"));
    }
}
