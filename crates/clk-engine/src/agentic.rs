//! Agentic fix: when every deterministic tier is exhausted, ask the model
//! for a structured repair of the failing command and evaluate it under a
//! strict schema.

use crate::executor::{DispatchResult, dispatch_and_wait};
use crate::learn::parse_json_lenient;
use crate::validate;
use crate::waiters::backoff_sleep;
use crate::{Ctx, learn};
use anyhow::Result;
use clk_core::{BindingMap, Failure, PlanCommand, key_accepts};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

const MAX_ATTEMPTS: u32 = 3;

/// The strict response schema. Anything outside it is ignored.
#[derive(Debug, Default, Deserialize)]
pub struct FixProposal {
    #[serde(default)]
    pub rewritten_args: Option<Vec<String>>,
    #[serde(default)]
    pub pre_commands: Option<Vec<Vec<String>>>,
    #[serde(default)]
    pub bindings: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub skip: Option<bool>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// What the agentic tier decided.
pub enum AgenticOutcome {
    /// Command (possibly rewritten) eventually succeeded.
    Fixed,
    /// Model says the command is unnecessary; mark done without running.
    Skipped,
    /// All attempts exhausted; the last failure stands.
    GaveUp(Failure),
    /// No oracle configured.
    Unavailable,
}

/// Run the agentic tier: up to three ask→apply→retry rounds with exponential
/// backoff.
pub async fn run(
    ctx: &Ctx,
    bindings: &mut BindingMap,
    cmd: &PlanCommand,
    failure: Failure,
    args: &[String],
) -> Result<AgenticOutcome> {
    let Some(oracle) = ctx.oracle.clone() else {
        return Ok(AgenticOutcome::Unavailable);
    };

    let mut last_failure = failure;
    let mut current_args = args.to_vec();

    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 && !backoff_sleep(&ctx.cancel, ctx.timings.llm_backoff_base, attempt - 1).await
        {
            return Ok(AgenticOutcome::GaveUp(last_failure));
        }
        ctx.say(&format!("agentic fix attempt {}", attempt + 1));

        let reply = match oracle
            .ask(&fix_prompt(&last_failure, &current_args, bindings))
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                debug!(error = %e, "agentic ask failed");
                continue;
            }
        };
        let Some(proposal) = parse_proposal(&reply) else {
            debug!("agentic reply did not match the schema");
            continue;
        };

        if let Some(notes) = &proposal.notes {
            ctx.say(&format!("model: {notes}"));
        }

        if proposal.skip == Some(true) {
            ctx.say("model marked this command as unnecessary; skipping");
            return Ok(AgenticOutcome::Skipped);
        }

        if let Some(proposed) = &proposal.bindings {
            for (key, value) in proposed {
                if key_accepts(key, value) {
                    debug!(key, value, "accepted agentic binding");
                    bindings.set(key, value.clone());
                } else {
                    debug!(key, value, "rejected mis-shaped agentic binding");
                }
            }
        }

        if let Some(pre_commands) = &proposal.pre_commands {
            for pre in pre_commands {
                if validate::check(pre, ctx.destroyer).is_err() {
                    debug!(?pre, "agentic pre-command rejected");
                    continue;
                }
                // Best-effort: learn from whatever succeeds.
                let out = ctx.run_cli(pre.clone()).await?;
                if out.success() {
                    let synthetic = PlanCommand {
                        args: pre.clone(),
                        reason: None,
                        produces: None,
                    };
                    learn::learn(&synthetic, pre, &out.merged, bindings);
                }
            }
        }

        if let Some(rewritten) = proposal.rewritten_args {
            if validate::check(&rewritten, ctx.destroyer).is_ok() {
                current_args = rewritten;
            } else {
                debug!("agentic rewritten_args rejected by validation");
            }
        }

        // Re-substitute so newly accepted bindings take effect.
        let mut retry_args = current_args.clone();
        let unresolved = crate::subst::substitute(&mut retry_args, bindings);
        if !unresolved.is_empty() {
            last_failure = Failure::synthetic(
                retry_args.first().map(String::as_str).unwrap_or(""),
                retry_args.get(1).map(String::as_str).unwrap_or(""),
                format!("unresolved placeholders: {unresolved:?}"),
            );
            continue;
        }

        match dispatch_and_wait(ctx, bindings, cmd, &retry_args).await? {
            DispatchResult::Success(_) => return Ok(AgenticOutcome::Fixed),
            DispatchResult::Failed(f) => last_failure = f,
        }
    }

    Ok(AgenticOutcome::GaveUp(last_failure))
}

fn fix_prompt(failure: &Failure, args: &[String], bindings: &BindingMap) -> String {
    format!(
        "An AWS CLI command keeps failing after deterministic remediation.\n\
         Command args (dispatcher flags excluded): {args:?}\n\
         Error: {}\n\
         Known bindings: {}\n\
         Reply with ONLY a JSON object with any of these fields:\n\
         {{\"rewritten_args\": [..], \"pre_commands\": [[..],..], \
         \"bindings\": {{\"KEY\": \"value\"}}, \"skip\": false, \"notes\": \"...\"}}\n\
         Use \"skip\": true only when the command is genuinely unnecessary. \
         No prose outside the JSON object.",
        failure.message,
        bindings.to_prompt_json()
    )
}

/// Parse the reply under the strict schema; reject anything that is not a
/// JSON object.
pub fn parse_proposal(reply: &str) -> Option<FixProposal> {
    let value = parse_json_lenient(&clk_ai::clean_json(reply))?;
    if !value.is_object() {
        return None;
    }
    serde_json::from_value::<FixProposal>(coerce_pre_commands(value)).ok()
}

/// Accept `pre_commands` given either as arrays of tokens or as objects with
/// an `args` field.
fn coerce_pre_commands(mut value: Value) -> Value {
    let Some(pre) = value.get_mut("pre_commands") else {
        return value;
    };
    let Some(items) = pre.as_array() else {
        return value;
    };
    let coerced: Vec<Value> = items
        .iter()
        .filter_map(|item| match item {
            Value::Array(_) => Some(item.clone()),
            Value::Object(map) => map.get("args").cloned(),
            _ => None,
        })
        .collect();
    *pre = Value::Array(coerced);
    value
}
