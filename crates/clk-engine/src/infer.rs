//! LLM escalation for unresolved placeholders: inference (propose values from
//! what is already known) and discovery (propose read-only commands whose
//! output contains the values).

use crate::learn::{json_path, parse_json_lenient};
use crate::validate;
use crate::waiters::backoff_sleep;
use crate::Ctx;
use anyhow::Result;
use clk_core::{BindingMap, key_accepts};
use serde_json::Value;
use tracing::debug;

const MAX_ATTEMPTS: u32 = 3;
const MAX_DISCOVERY_COMMANDS: usize = 3;

/// Operation prefixes a discovery command may use.
const READ_ONLY_PREFIXES: &[&str] = &["describe", "list", "get"];

/// Try to resolve `unresolved` placeholder tokens. Inference first, then
/// discovery; both phases retry with exponential backoff. Accepted values
/// must pass the per-key shape predicate.
pub async fn resolve_unresolved(
    ctx: &Ctx,
    bindings: &mut BindingMap,
    args: &[String],
    unresolved: &[String],
) -> Result<()> {
    let Some(oracle) = ctx.oracle.clone() else {
        return Ok(());
    };
    let keys: Vec<String> = unresolved
        .iter()
        .map(|t| t.trim_matches(['<', '>']).to_string())
        .collect();

    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 && !backoff_sleep(&ctx.cancel, ctx.timings.llm_backoff_base, attempt - 1).await {
            return Ok(());
        }
        ctx.say(&format!(
            "asking the model to infer values for {keys:?} (attempt {})",
            attempt + 1
        ));
        match oracle.ask(&inference_prompt(&keys, args, bindings)).await {
            Ok(text) => {
                if apply_proposed(&keys, &text, bindings) && all_resolved(&keys, bindings) {
                    return Ok(());
                }
            }
            Err(e) => debug!(error = %e, "inference ask failed"),
        }
        if all_resolved(&keys, bindings) {
            return Ok(());
        }
    }

    for attempt in 0..MAX_ATTEMPTS {
        if all_resolved(&keys, bindings) {
            return Ok(());
        }
        if attempt > 0 && !backoff_sleep(&ctx.cancel, ctx.timings.llm_backoff_base, attempt - 1).await {
            return Ok(());
        }
        ctx.say(&format!(
            "asking the model for discovery commands for {keys:?} (attempt {})",
            attempt + 1
        ));
        match oracle.ask(&discovery_prompt(&keys, args, bindings)).await {
            Ok(text) => {
                if run_discovery(ctx, bindings, &text).await? {
                    return Ok(());
                }
            }
            Err(e) => debug!(error = %e, "discovery ask failed"),
        }
    }
    Ok(())
}

fn all_resolved(keys: &[String], bindings: &BindingMap) -> bool {
    keys.iter().all(|k| bindings.contains(k))
}

fn inference_prompt(keys: &[String], args: &[String], bindings: &BindingMap) -> String {
    format!(
        "You are repairing an AWS CLI command that references unresolved placeholders.\n\
         Unresolved keys: {keys:?}\n\
         Command args: {args:?}\n\
         Known bindings: {}\n\
         Reply with ONLY a JSON object mapping each key you can confidently \
         infer to its concrete value. Omit keys you cannot infer. No prose.",
        bindings.to_prompt_json()
    )
}

fn discovery_prompt(keys: &[String], args: &[String], bindings: &BindingMap) -> String {
    format!(
        "You are locating AWS resource identifiers.\n\
         Needed keys: {keys:?}\n\
         Failing command args: {args:?}\n\
         Known bindings: {}\n\
         Reply with ONLY a JSON array of at most {MAX_DISCOVERY_COMMANDS} read-only AWS CLI \
         commands, each shaped {{\"args\": [\"service\", \"describe-...\", ...], \
         \"extract\": {{\"KEY\": \"Json.Path[0].Here\"}}}}. Commands must be \
         describe/list/get operations only. No prose.",
        bindings.to_prompt_json()
    )
}

/// Parse an inference reply and bind every shape-valid proposal for a key we
/// actually asked about. Returns whether anything was accepted.
fn apply_proposed(keys: &[String], reply: &str, bindings: &mut BindingMap) -> bool {
    let Some(Value::Object(map)) = parse_json_lenient(&clk_ai::clean_json(reply)) else {
        return false;
    };
    let mut accepted = false;
    for (key, value) in map {
        let Some(value) = value.as_str() else { continue };
        if !keys.contains(&key) {
            continue;
        }
        if key_accepts(&key, value) {
            debug!(key, value, "accepted inferred binding");
            bindings.set(&key, value.to_string());
            accepted = true;
        } else {
            debug!(key, value, "rejected mis-shaped inferred binding");
        }
    }
    accepted
}

/// Run validated discovery commands and extract bindings from their output.
/// Returns whether at least one binding was learned.
async fn run_discovery(ctx: &Ctx, bindings: &mut BindingMap, reply: &str) -> Result<bool> {
    let Some(Value::Array(commands)) = parse_json_lenient(&clk_ai::clean_json(reply)) else {
        return Ok(false);
    };
    let mut learned = false;
    for command in commands.into_iter().take(MAX_DISCOVERY_COMMANDS) {
        let Some(args) = command
            .get("args")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
        else {
            continue;
        };
        if !is_read_only(&args) || validate::check(&args, false).is_err() {
            debug!(?args, "discovery command rejected");
            continue;
        }
        let Some(output) = ctx.run_aws_json(&args.iter().map(String::as_str).collect::<Vec<_>>()).await?
        else {
            continue;
        };
        let Some(extract) = command.get("extract").and_then(Value::as_object) else {
            continue;
        };
        for (key, path) in extract {
            let Some(path) = path.as_str() else { continue };
            let Some(value) = json_path(&output, path).and_then(Value::as_str) else {
                continue;
            };
            if key_accepts(key, value) {
                debug!(key, value, "binding learned via discovery");
                bindings.set(key, value.to_string());
                learned = true;
            }
        }
    }
    Ok(learned)
}

fn is_read_only(args: &[String]) -> bool {
    args.get(1)
        .map(|op| READ_ONLY_PREFIXES.iter().any(|p| op.starts_with(p)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proposed_bindings_are_shape_checked() {
        let mut bindings = BindingMap::new();
        let keys = vec!["SG_RDS_ID".to_string(), "TG_ARN".to_string()];
        let reply = r#"{"SG_RDS_ID": "sg-bbb", "TG_ARN": "not-an-arn", "UNASKED": "x"}"#;
        assert!(apply_proposed(&keys, reply, &mut bindings));
        assert_eq!(bindings.get("SG_RDS_ID"), Some("sg-bbb"));
        assert_eq!(bindings.get("TG_ARN"), None);
        assert_eq!(bindings.get("UNASKED"), None);
    }

    #[test]
    fn fenced_reply_is_cleaned() {
        let mut bindings = BindingMap::new();
        let keys = vec!["VPC_ID".to_string()];
        let reply = "Sure!\n```json\n{\"VPC_ID\": \"vpc-77\"}\n```";
        assert!(apply_proposed(&keys, reply, &mut bindings));
        assert_eq!(bindings.get("VPC_ID"), Some("vpc-77"));
    }

    #[test]
    fn garbage_reply_is_rejected() {
        let mut bindings = BindingMap::new();
        let keys = vec!["VPC_ID".to_string()];
        assert!(!apply_proposed(&keys, "I could not find anything.", &mut bindings));
        assert!(bindings.is_empty());
    }

    #[test]
    fn read_only_gate() {
        let ok = ["ec2", "describe-security-groups"].map(String::from);
        assert!(is_read_only(&ok));
        let list = ["elbv2", "list-tags"].map(String::from);
        assert!(is_read_only(&list));
        let bad = ["ec2", "create-security-group"].map(String::from);
        assert!(!is_read_only(&bad));
        let worse = ["ec2", "delete-vpc"].map(String::from);
        assert!(!is_read_only(&worse));
    }
}
