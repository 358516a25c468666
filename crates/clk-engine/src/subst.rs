//! Placeholder substitution over argument vectors, plus the account-id token
//! special case.

use crate::Ctx;
use anyhow::{Context as _, Result, bail};
use clk_core::BindingMap;
use std::sync::OnceLock;

/// Literal spellings that all mean "the caller's AWS account id".
const ACCOUNT_TOKENS: &[&str] = &["<YOUR_ACCOUNT_ID>", "<ACCOUNT_ID>", "REPLACE_WITH_ACCOUNT_ID"];

fn token_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"<([A-Z0-9_]+)>").expect("static regex"))
}

/// Substitute `<TOKEN>` placeholders from the binding map, in place. Returns
/// the tokens that stayed unresolved (deduplicated, in order of appearance).
pub fn substitute(args: &mut [String], bindings: &BindingMap) -> Vec<String> {
    let mut unresolved = Vec::new();
    for arg in args.iter_mut() {
        if !arg.contains('<') {
            continue;
        }
        let replaced = token_re().replace_all(arg, |caps: &regex::Captures<'_>| {
            let key = normalize_key(&caps[1]);
            match bindings.get(key) {
                Some(value) => value.to_string(),
                None => {
                    let token = caps[0].to_string();
                    if !unresolved.contains(&token) {
                        unresolved.push(token.clone());
                    }
                    token
                }
            }
        });
        *arg = replaced.into_owned();
    }
    unresolved
}

/// Map placeholder spellings onto canonical binding keys.
fn normalize_key(key: &str) -> &str {
    match key {
        "YOUR_ACCOUNT_ID" => "ACCOUNT_ID",
        other => other,
    }
}

/// Whether any arg still carries an account-id token in one of its spellings.
pub fn needs_account_id(args: &[String]) -> bool {
    args.iter()
        .any(|arg| ACCOUNT_TOKENS.iter().any(|t| arg.contains(t)))
}

/// Resolve the caller's account id once via STS and bind it, then rewrite all
/// account-token spellings in place.
pub async fn resolve_account_tokens(
    ctx: &Ctx,
    bindings: &mut BindingMap,
    args: &mut [String],
) -> Result<()> {
    if bindings.get("ACCOUNT_ID").is_none() {
        let value = ctx
            .run_aws_json(&["sts", "get-caller-identity", "--output", "json"])
            .await?
            .and_then(|v| v.get("Account").and_then(|a| a.as_str()).map(String::from))
            .context("sts get-caller-identity returned no Account")?;
        if value.len() != 12 || !value.bytes().all(|b| b.is_ascii_digit()) {
            bail!("account id '{value}' is not 12 digits");
        }
        ctx.say(&format!("resolved account id {value}"));
        bindings.set("ACCOUNT_ID", value);
    }
    let account = bindings.get("ACCOUNT_ID").expect("just set").to_string();
    for arg in args.iter_mut() {
        for token in ACCOUNT_TOKENS {
            if arg.contains(token) {
                *arg = arg.replace(token, &account);
            }
        }
    }
    Ok(())
}
