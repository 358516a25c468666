//! Narrow LLM capability used by the healing tiers: ask a prompt, get text
//! back, and clean the text into parseable JSON. The engine never depends on
//! a specific provider.

mod anthropic;
mod openai;

pub use anthropic::AnthropicOracle;
pub use openai::OpenAiOracle;

use anyhow::{Result, bail};
use std::sync::Arc;

/// The whole surface the engine needs from a model provider.
#[async_trait::async_trait]
pub trait Oracle: Send + Sync {
    async fn ask(&self, prompt: &str) -> Result<String>;
}

/// Supported provider families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiProvider {
    Anthropic,
    OpenAi,
}

impl std::str::FromStr for AiProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" | "gpt" => Ok(Self::OpenAi),
            other => bail!("unknown AI provider '{other}' (expected anthropic or openai)"),
        }
    }
}

/// Build an oracle for the chosen provider. `model` falls back to the
/// provider's default.
pub fn build_oracle(
    provider: AiProvider,
    api_key: &str,
    model: Option<&str>,
) -> Arc<dyn Oracle> {
    match provider {
        AiProvider::Anthropic => Arc::new(AnthropicOracle::new(api_key, model)),
        AiProvider::OpenAi => Arc::new(OpenAiOracle::new(api_key, model)),
    }
}

/// Strip markdown fences and surrounding prose so the result starts at the
/// first JSON object or array and ends at its matching close. Models wrap
/// JSON in commentary no matter how firmly the prompt forbids it.
pub fn clean_json(text: &str) -> String {
    let trimmed = text.trim();

    // Prefer a fenced block when one exists.
    if let Some(fenced) = extract_fenced(trimmed) {
        return fenced.trim().to_string();
    }

    let start = match trimmed.find(['{', '[']) {
        Some(idx) => idx,
        None => return trimmed.to_string(),
    };
    let bytes = trimmed.as_bytes();
    let open = bytes[start] as char;
    let close = if open == '{' { '}' } else { ']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in trimmed[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    return trimmed[start..start + offset + c.len_utf8()].to_string();
                }
            }
            _ => {}
        }
    }
    trimmed[start..].to_string()
}

fn extract_fenced(text: &str) -> Option<&str> {
    let fence_start = text.find("```")?;
    let after = &text[fence_start + 3..];
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let fence_end = body.find("```")?;
    Some(&body[..fence_end])
}
