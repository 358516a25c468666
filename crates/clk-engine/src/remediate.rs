//! Remediation pipeline: built-in prerequisite commands for known failure
//! shapes, then an optional LLM-proposed prerequisite plan, then a retry of
//! the original command.

use crate::argops::flag_value;
use crate::learn::parse_json_lenient;
use crate::validate;
use crate::waiters::backoff_sleep;
use crate::{Ctx, learn};
use anyhow::Result;
use clk_core::{BindingMap, Failure, FailureCategory, PlanCommand};
use serde_json::Value;
use tracing::debug;

const MAX_LLM_PREREQS: usize = 4;

/// Trust policy for roles created as a prerequisite. Service principal is
/// picked from the role name.
fn assume_role_document(role_name: &str) -> String {
    let service = if role_name.to_ascii_lowercase().contains("lambda") {
        "lambda.amazonaws.com"
    } else {
        "ec2.amazonaws.com"
    };
    format!(
        r#"{{"Version":"2012-10-17","Statement":[{{"Effect":"Allow","Principal":{{"Service":"{service}"}},"Action":"sts:AssumeRole"}}]}}"#
    )
}

/// Built-in prerequisite commands for a failure, or empty when none apply.
pub fn builtin_prerequisites(failure: &Failure, args: &[String]) -> Vec<Vec<String>> {
    let service = failure.service.as_str();
    let op = failure.op.as_str();

    if failure.category == FailureCategory::NotFound {
        // Attaching policy to a role that does not exist yet.
        if service == "iam" && (op == "attach-role-policy" || op == "put-role-policy") {
            if let Some(role) = flag_value(args, "--role-name") {
                return vec![vec![
                    "iam".to_string(),
                    "create-role".to_string(),
                    "--role-name".to_string(),
                    role.to_string(),
                    "--assume-role-policy-document".to_string(),
                    assume_role_document(role),
                ]];
            }
        }

        // Instance profile missing for a run-instances call.
        if service == "iam" && op == "add-role-to-instance-profile" {
            if let Some(profile) = flag_value(args, "--instance-profile-name") {
                return vec![vec![
                    "iam".to_string(),
                    "create-instance-profile".to_string(),
                    "--instance-profile-name".to_string(),
                    profile.to_string(),
                ]];
            }
        }

        // Writing to a log group that was never created.
        if service == "logs" && op != "create-log-group" {
            if let Some(group) = flag_value(args, "--log-group-name") {
                return vec![vec![
                    "logs".to_string(),
                    "create-log-group".to_string(),
                    "--log-group-name".to_string(),
                    group.to_string(),
                ]];
            }
        }
    }

    Vec::new()
}

/// Outcome of one remediation entry.
pub enum RemediateOutcome {
    /// Prerequisites ran; the loop should retry the original command.
    RetryOriginal,
    /// Nothing applied.
    NotApplicable,
}

/// Run the remediation tier: built-ins first; if none apply and an oracle is
/// available, ask it for a short prerequisite plan. Prerequisite outputs are
/// learned so the retried command sees their bindings.
pub async fn run(
    ctx: &Ctx,
    bindings: &mut BindingMap,
    failure: &Failure,
    args: &[String],
) -> Result<RemediateOutcome> {
    let builtins = builtin_prerequisites(failure, args);
    if !builtins.is_empty() {
        ctx.say(&format!(
            "running {} built-in prerequisite command(s)",
            builtins.len()
        ));
        let ran = run_prerequisites(ctx, bindings, &builtins).await?;
        if ran {
            return Ok(RemediateOutcome::RetryOriginal);
        }
    }

    let Some(oracle) = ctx.oracle.clone() else {
        return Ok(RemediateOutcome::NotApplicable);
    };

    for attempt in 0..3u32 {
        if attempt > 0 && !backoff_sleep(&ctx.cancel, ctx.timings.llm_backoff_base, attempt - 1).await
        {
            return Ok(RemediateOutcome::NotApplicable);
        }
        ctx.say("asking the model for a remediation plan");
        let reply = match oracle.ask(&remediation_prompt(failure, args, bindings)).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(error = %e, "remediation ask failed");
                continue;
            }
        };
        let Some(prereqs) = parse_prerequisites(&reply, ctx.destroyer) else {
            continue;
        };
        if prereqs.is_empty() {
            continue;
        }
        ctx.say(&format!(
            "running {} model-proposed prerequisite command(s)",
            prereqs.len()
        ));
        if run_prerequisites(ctx, bindings, &prereqs).await? {
            return Ok(RemediateOutcome::RetryOriginal);
        }
    }

    Ok(RemediateOutcome::NotApplicable)
}

/// Run prerequisites best-effort, learning from each success. Returns whether
/// at least one succeeded.
async fn run_prerequisites(
    ctx: &Ctx,
    bindings: &mut BindingMap,
    prereqs: &[Vec<String>],
) -> Result<bool> {
    let mut any = false;
    for prereq in prereqs {
        let out = ctx.run_cli(prereq.clone()).await?;
        if out.success() {
            any = true;
            let synthetic = PlanCommand {
                args: prereq.clone(),
                reason: None,
                produces: None,
            };
            learn::learn(&synthetic, prereq, &out.merged, bindings);
        } else {
            // Already-exists from a prerequisite is as good as success.
            let failure = Failure::from_output(
                prereq.first().map(String::as_str).unwrap_or(""),
                prereq.get(1).map(String::as_str).unwrap_or(""),
                &out.merged,
            );
            if failure.category == FailureCategory::AlreadyExists {
                any = true;
            }
        }
    }
    Ok(any)
}

fn remediation_prompt(failure: &Failure, args: &[String], bindings: &BindingMap) -> String {
    format!(
        "An AWS CLI command failed and may be missing a prerequisite resource.\n\
         Command args: {args:?}\n\
         Error category: {}\n\
         Error output: {}\n\
         Known bindings: {}\n\
         Reply with ONLY a JSON array of at most {MAX_LLM_PREREQS} prerequisite AWS CLI \
         commands (each {{\"args\": [...]}}), biased toward describe/create of \
         missing prerequisites. Never destructive operations. No prose.",
        failure.category, failure.message, bindings.to_prompt_json()
    )
}

/// Parse and validate an LLM prerequisite plan.
fn parse_prerequisites(reply: &str, destroyer: bool) -> Option<Vec<Vec<String>>> {
    let Value::Array(items) = parse_json_lenient(&clk_ai::clean_json(reply))? else {
        return None;
    };
    let mut out = Vec::new();
    for item in items.into_iter().take(MAX_LLM_PREREQS) {
        let args: Vec<String> = match &item {
            Value::Object(map) => map
                .get("args")?
                .as_array()?
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect(),
            Value::Array(tokens) => tokens
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect(),
            _ => continue,
        };
        if args.is_empty() || validate::check(&args, destroyer).is_err() {
            debug!(?args, "proposed prerequisite rejected");
            continue;
        }
        out.push(args);
    }
    Some(out)
}
