//! Chat message intake: turns a free-form message into a goal and context.
//!
//! Intake never fails. Any provider error, timeout or undecodable reply
//! falls back to using the whole message as the goal. So does cancellation,
//! which the caller then reports when it checks the token.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{CapabilityProvider, CapabilityRole, PromptLibrary, PromptVars};
use crate::pipeline::output_parser;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedMessage {
    pub goal: String,
    pub context: String,
}

impl ParsedMessage {
    /// Whole message as goal, empty context
    pub fn fallback(message: &str) -> Self {
        Self {
            goal: message.trim().to_string(),
            context: String::new(),
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        let goal = value.get("user_goal")?.as_str()?.trim();
        if goal.is_empty() {
            return None;
        }
        let context = value
            .get("user_context")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim();

        Some(Self {
            goal: goal.to_string(),
            context: context.to_string(),
        })
    }
}

pub struct IntakeParser<'a> {
    provider: &'a dyn CapabilityProvider,
    prompts: &'a PromptLibrary,
    timeout: Duration,
}

impl<'a> IntakeParser<'a> {
    pub fn new(
        provider: &'a dyn CapabilityProvider,
        prompts: &'a PromptLibrary,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            prompts,
            timeout,
        }
    }

    pub async fn parse(&self, message: &str, cancel: &CancellationToken) -> ParsedMessage {
        let mut vars = PromptVars::new();
        vars.insert("message", message.trim().to_string());
        let prompt = self.prompts.render(CapabilityRole::Intake, &vars);

        let call = self.provider.invoke(CapabilityRole::Intake, &prompt);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("intake: cancelled, using raw message");
                return ParsedMessage::fallback(message);
            }
            outcome = tokio::time::timeout(self.timeout, call) => outcome,
        };

        let raw = match outcome {
            Ok(Ok(raw)) => raw,
            Ok(Err(err)) => {
                tracing::warn!(%err, "intake: provider failed, using raw message");
                return ParsedMessage::fallback(message);
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "intake: timed out, using raw message");
                return ParsedMessage::fallback(message);
            }
        };

        match output_parser::extract_structured(&raw)
            .as_ref()
            .and_then(ParsedMessage::from_value)
        {
            Some(parsed) => parsed,
            None => {
                tracing::debug!("intake: reply had no usable user_goal, using raw message");
                ParsedMessage::fallback(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::provider::mock::ScriptedProvider;
    use crate::capabilities::CapabilityError;

    const MESSAGE: &str = "我想做一个AI写作助手，面向大学生，预算有限";

    fn parse_with(provider: &ScriptedProvider, timeout: Duration) -> ParsedMessage {
        let prompts = PromptLibrary::defaults();
        let parser = IntakeParser::new(provider, &prompts, timeout);
        tokio_test::block_on(parser.parse(MESSAGE, &CancellationToken::new()))
    }

    #[test]
    fn test_extracts_goal_and_context() {
        let provider = ScriptedProvider::new().reply(
            CapabilityRole::Intake,
            "```json\n{\"user_goal\": \"AI写作助手\", \"user_context\": \"面向大学生，预算有限\"}\n```",
        );

        let parsed = parse_with(&provider, Duration::from_secs(5));
        assert_eq!(parsed.goal, "AI写作助手");
        assert_eq!(parsed.context, "面向大学生，预算有限");

        let (_, prompt) = &provider.calls()[0];
        assert!(prompt.contains(MESSAGE));
    }

    #[test]
    fn test_falls_back_on_prose() {
        let provider = ScriptedProvider::new().reply(CapabilityRole::Intake, "好的，我明白了。");
        assert_eq!(
            parse_with(&provider, Duration::from_secs(5)),
            ParsedMessage::fallback(MESSAGE)
        );
    }

    #[test]
    fn test_falls_back_on_blank_goal() {
        let provider = ScriptedProvider::new()
            .reply(CapabilityRole::Intake, r#"{"user_goal": "  ", "user_context": "x"}"#);
        assert_eq!(parse_with(&provider, Duration::from_secs(5)).goal, MESSAGE);
    }

    #[test]
    fn test_falls_back_on_provider_error() {
        let provider = ScriptedProvider::new().fail(
            CapabilityRole::Intake,
            CapabilityError::Network("connection reset".to_string()),
        );
        let parsed = parse_with(&provider, Duration::from_secs(5));
        assert_eq!(parsed.goal, MESSAGE);
        assert!(parsed.context.is_empty());
    }

    #[tokio::test]
    async fn test_falls_back_on_timeout() {
        let provider = ScriptedProvider::new().delay(
            CapabilityRole::Intake,
            Duration::from_millis(500),
            r#"{"user_goal": "late"}"#,
        );
        let prompts = PromptLibrary::defaults();
        let parser = IntakeParser::new(&provider, &prompts, Duration::from_millis(20));

        let parsed = parser.parse(MESSAGE, &CancellationToken::new()).await;
        assert_eq!(parsed.goal, MESSAGE);
    }

    #[tokio::test]
    async fn test_cancelled_token_skips_slow_provider() {
        let provider = ScriptedProvider::new().delay(
            CapabilityRole::Intake,
            Duration::from_secs(3),
            r#"{"user_goal": "late"}"#,
        );
        let prompts = PromptLibrary::defaults();
        let parser = IntakeParser::new(&provider, &prompts, Duration::from_secs(10));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = std::time::Instant::now();
        let parsed = parser.parse(MESSAGE, &cancel).await;

        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(parsed, ParsedMessage::fallback(MESSAGE));
    }
}
