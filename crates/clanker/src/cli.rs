//! Small helpers for the CLI surface: plan loading, oracle construction, and
//! the stdout progress writer.

use anyhow::{Context, Result, bail};
use clk_ai::{AiProvider, Oracle};
use clk_core::Plan;
use clk_process::SharedWriter;
use std::io::Read;
use std::sync::{Arc, Mutex};

/// Load a plan from a file path, or from stdin when the path is `-`.
pub fn load_plan(path: &str) -> Result<Plan> {
    let text = if path == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read plan from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?
    };
    Ok(Plan::from_json(&text)?)
}

/// Build the oracle for the chosen provider, taking the API key from the
/// provider's conventional environment variable.
pub fn make_oracle(provider: AiProvider, model: Option<&str>) -> Result<Arc<dyn Oracle>> {
    let env_var = match provider {
        AiProvider::Anthropic => "ANTHROPIC_API_KEY",
        AiProvider::OpenAi => "OPENAI_API_KEY",
    };
    let Ok(api_key) = std::env::var(env_var) else {
        bail!("{env_var} is not set; either export it or drop --ai-provider");
    };
    Ok(clk_ai::build_oracle(provider, &api_key, model))
}

/// Progress writer over stdout.
pub fn stdout_writer() -> SharedWriter {
    Arc::new(Mutex::new(std::io::stdout()))
}
