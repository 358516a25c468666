//! IAM glue: a role cannot be deleted while anything still references it.
//! Detach everything, wait for convergence, then retry the delete.

use crate::argops::flag_value;
use crate::glue::GlueOutcome;
use crate::learn::json_path;
use crate::waiters::sleep_cancellable;
use crate::Ctx;
use anyhow::Result;
use serde_json::Value;
use std::time::{Duration, Instant};

const DELETE_RETRIES: u32 = 6;

/// `iam delete-role` hit a DeleteConflict: detach managed policies, delete
/// inline policies, remove the role from instance profiles, drop the
/// permissions boundary, wait up to the convergence bound, then retry the
/// delete with linear backoff.
pub async fn fix_delete_role(ctx: &Ctx, args: &[String]) -> Result<GlueOutcome> {
    let Some(role) = flag_value(args, "--role-name").map(String::from) else {
        return Ok(GlueOutcome::NotApplicable);
    };
    ctx.say(&format!("detaching everything from role {role} before delete"));

    if let Some(attached) = ctx
        .run_aws_json(&[
            "iam", "list-attached-role-policies", "--role-name", &role, "--output", "json",
        ])
        .await?
    {
        if let Some(policies) = attached.get("AttachedPolicies").and_then(Value::as_array) {
            for policy in policies {
                if let Some(arn) = policy.get("PolicyArn").and_then(Value::as_str) {
                    let _ = ctx
                        .run_aws(&[
                            "iam", "detach-role-policy", "--role-name", &role, "--policy-arn", arn,
                        ])
                        .await?;
                }
            }
        }
    }

    if let Some(inline) = ctx
        .run_aws_json(&["iam", "list-role-policies", "--role-name", &role, "--output", "json"])
        .await?
    {
        if let Some(names) = inline.get("PolicyNames").and_then(Value::as_array) {
            for name in names.iter().filter_map(Value::as_str) {
                let _ = ctx
                    .run_aws(&[
                        "iam", "delete-role-policy", "--role-name", &role, "--policy-name", name,
                    ])
                    .await?;
            }
        }
    }

    if let Some(profiles) = ctx
        .run_aws_json(&[
            "iam", "list-instance-profiles-for-role", "--role-name", &role, "--output", "json",
        ])
        .await?
    {
        if let Some(list) = profiles.get("InstanceProfiles").and_then(Value::as_array) {
            for profile in list {
                if let Some(name) = profile.get("InstanceProfileName").and_then(Value::as_str) {
                    let _ = ctx
                        .run_aws(&[
                            "iam",
                            "remove-role-from-instance-profile",
                            "--instance-profile-name",
                            name,
                            "--role-name",
                            &role,
                        ])
                        .await?;
                }
            }
        }
    }

    // Best-effort; most roles have no boundary.
    let _ = ctx
        .run_aws(&["iam", "delete-role-permissions-boundary", "--role-name", &role])
        .await?;

    wait_for_detach_convergence(ctx, &role).await?;

    for attempt in 1..=DELETE_RETRIES {
        let out = ctx
            .run_aws(&["iam", "delete-role", "--role-name", &role])
            .await?;
        if out.success() {
            ctx.say(&format!("role {role} deleted"));
            return Ok(GlueOutcome::Resolved);
        }
        if attempt < DELETE_RETRIES {
            let delay = ctx.timings.iam_delete_base.saturating_mul(attempt);
            if !sleep_cancellable(&ctx.cancel, delay).await {
                return Ok(GlueOutcome::NotApplicable);
            }
        }
    }
    Ok(GlueOutcome::NotApplicable)
}

/// IAM is eventually consistent: poll until the attached-policy list reads
/// empty or the convergence bound passes.
async fn wait_for_detach_convergence(ctx: &Ctx, role: &str) -> Result<()> {
    let started = Instant::now();
    let step = Duration::from_secs(1).min(ctx.timings.iam_converge);
    while started.elapsed() < ctx.timings.iam_converge {
        let attached = ctx
            .run_aws_json(&[
                "iam", "list-attached-role-policies", "--role-name", role, "--output", "json",
            ])
            .await?;
        let remaining = attached
            .as_ref()
            .and_then(|a| json_path(a, "AttachedPolicies"))
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        if remaining == 0 {
            return Ok(());
        }
        if !sleep_cancellable(&ctx.cancel, step).await {
            return Ok(());
        }
    }
    Ok(())
}
