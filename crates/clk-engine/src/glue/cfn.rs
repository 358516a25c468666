//! CloudFormation glue: subnet-CIDR template rewriting, create→update
//! switching, and the terminal-status waiter.

use crate::argops::{flag_value, set_flag_value, set_op};
use crate::glue::GlueOutcome;
use crate::glue::cidr::{existing_associations, first_free_block};
use crate::learn::json_path;
use crate::waiters::{WaitOutcome, Waiter};
use crate::Ctx;
use anyhow::Result;
use clk_core::{BindingMap, Failure};
use ipnet::Ipv4Net;
use serde_json::Value;

/// Whether a create/update-stack failure is the subnet-CIDR conflict family
/// this glue knows how to fix.
pub fn is_cidr_failure(failure: &Failure) -> bool {
    let lowered = failure.message.to_ascii_lowercase();
    lowered.contains("cidr") && (lowered.contains("subnet") || lowered.contains("conflict") || lowered.contains("invalid"))
}

/// Handle a failed `cloudformation create-stack`/`update-stack`:
/// - rewrite up to two `AWS::EC2::Subnet` CIDRs in the template body when the
///   failure references a CIDR conflict;
/// - switch `create-stack` to `update-stack` when the stack already exists in
///   a rolled-back terminal state.
pub async fn fix_stack(
    ctx: &Ctx,
    bindings: &BindingMap,
    failure: &Failure,
    args: &[String],
) -> Result<GlueOutcome> {
    let Some(stack_name) = flag_value(args, "--stack-name") else {
        return Ok(GlueOutcome::NotApplicable);
    };

    let mut rewritten = args.to_vec();
    let mut changed = false;

    if is_cidr_failure(failure) {
        if let Some(body) = flag_value(args, "--template-body") {
            if let Some(new_body) = rewrite_subnet_cidrs(ctx, bindings, body).await? {
                ctx.say("rewrote conflicting subnet CIDRs in the stack template");
                set_flag_value(&mut rewritten, "--template-body", &new_body);
                changed = true;
            }
        }
    }

    if failure.op == "create-stack" && stack_exists_rolled_back(ctx, stack_name).await? {
        ctx.say(&format!(
            "stack {stack_name} already exists; switching to update-stack"
        ));
        set_op(&mut rewritten, "update-stack");
        changed = true;
    }

    if changed {
        Ok(GlueOutcome::Rewritten(rewritten))
    } else {
        Ok(GlueOutcome::NotApplicable)
    }
}

async fn stack_exists_rolled_back(ctx: &Ctx, stack_name: &str) -> Result<bool> {
    let Some(stacks) = ctx
        .run_aws_json(&[
            "cloudformation",
            "describe-stacks",
            "--stack-name",
            stack_name,
            "--output",
            "json",
        ])
        .await?
    else {
        return Ok(false);
    };
    let status = json_path(&stacks, "Stacks[0].StackStatus")
        .and_then(Value::as_str)
        .unwrap_or("");
    Ok(status.contains("ROLLBACK_COMPLETE") || status.ends_with("_FAILED") || status == "CREATE_COMPLETE" || status == "UPDATE_COMPLETE")
}

/// Parse the template (JSON first, then YAML), move up to two
/// `AWS::EC2::Subnet` CIDRs onto free /24s inside the VPC, and re-emit in the
/// original format. `None` when there is nothing to rewrite.
async fn rewrite_subnet_cidrs(
    ctx: &Ctx,
    bindings: &BindingMap,
    body: &str,
) -> Result<Option<String>> {
    let (mut template, was_yaml) = match serde_json::from_str::<Value>(body) {
        Ok(v) => (v, false),
        Err(_) => match serde_yaml::from_str::<Value>(body) {
            Ok(v) => (v, true),
            Err(_) => return Ok(None),
        },
    };

    let vpc_net = vpc_cidr(ctx, bindings).await?;
    let mut taken = occupied_cidrs(ctx, bindings).await?;

    let Some(resources) = template
        .get_mut("Resources")
        .and_then(Value::as_object_mut)
    else {
        return Ok(None);
    };

    let subnet_keys: Vec<String> = resources
        .iter()
        .filter(|(_, res)| {
            res.get("Type").and_then(Value::as_str) == Some("AWS::EC2::Subnet")
        })
        .map(|(k, _)| k.clone())
        .take(2)
        .collect();
    if subnet_keys.is_empty() {
        return Ok(None);
    }

    let mut changed = false;
    for key in subnet_keys {
        let Some(free) = first_free_block(&taken, vpc_net, 24) else {
            break;
        };
        taken.push(free);
        if let Some(props) = resources
            .get_mut(&key)
            .and_then(|r| r.get_mut("Properties"))
            .and_then(Value::as_object_mut)
        {
            props.insert("CidrBlock".to_string(), Value::String(free.to_string()));
            changed = true;
        }
    }
    if !changed {
        return Ok(None);
    }

    let emitted = if was_yaml {
        serde_yaml::to_string(&template)?
    } else {
        serde_json::to_string(&template)?
    };
    Ok(Some(emitted))
}

/// The VPC range new subnets must fit inside: the `VPC_CIDR` binding when
/// known, else the live association, else 10.0.0.0/16.
async fn vpc_cidr(ctx: &Ctx, bindings: &BindingMap) -> Result<Ipv4Net> {
    if let Some(net) = bindings.get("VPC_CIDR").and_then(|c| c.parse().ok()) {
        return Ok(net);
    }
    if let Some(vpc_id) = bindings.get("VPC_ID") {
        if let Some(vpcs) = ctx
            .run_aws_json(&["ec2", "describe-vpcs", "--vpc-ids", vpc_id, "--output", "json"])
            .await?
        {
            if let Some(first) = existing_associations(&vpcs).first() {
                return Ok(*first);
            }
        }
    }
    Ok("10.0.0.0/16".parse().expect("static cidr"))
}

/// CIDRs already carved out of the VPC (live subnets), so the rewrite does
/// not trade one conflict for another.
async fn occupied_cidrs(ctx: &Ctx, bindings: &BindingMap) -> Result<Vec<Ipv4Net>> {
    let Some(vpc_id) = bindings.get("VPC_ID") else {
        return Ok(Vec::new());
    };
    let Some(subnets) = ctx
        .run_aws_json(&[
            "ec2",
            "describe-subnets",
            "--filters",
            &format!("Name=vpc-id,Values={vpc_id}"),
            "--output",
            "json",
        ])
        .await?
    else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    if let Some(list) = subnets.get("Subnets").and_then(Value::as_array) {
        for subnet in list {
            if let Some(net) = subnet
                .get("CidrBlock")
                .and_then(Value::as_str)
                .and_then(|c| c.parse().ok())
            {
                out.push(net);
            }
        }
    }
    Ok(out)
}

/// Statuses that end a stack operation well.
fn is_success_status(status: &str) -> bool {
    matches!(status, "CREATE_COMPLETE" | "UPDATE_COMPLETE" | "IMPORT_COMPLETE")
}

/// After a successful `create-stack`/`update-stack` dispatch, poll until the
/// stack reaches a terminal status (anything not ending `_IN_PROGRESS`). On a
/// bad terminal status, summarize the last stack events and synthesize a
/// failure for the healing pipeline.
pub async fn wait_stack(ctx: &Ctx, op: &str, args: &[String]) -> Result<Option<Failure>> {
    let Some(stack_name) = flag_value(args, "--stack-name").map(String::from) else {
        return Ok(None);
    };
    ctx.say(&format!("waiting for stack {stack_name} to settle"));

    let waiter = Waiter {
        description: "cloudformation terminal status",
        poll_interval: ctx.timings.cfn_poll,
        deadline: ctx.timings.cfn_deadline,
    };
    let outcome = waiter
        .run(&ctx.cancel, || {
            let stack_name = stack_name.clone();
            async move {
                let Some(stacks) = ctx
                    .run_aws_json(&[
                        "cloudformation",
                        "describe-stacks",
                        "--stack-name",
                        &stack_name,
                        "--output",
                        "json",
                    ])
                    .await?
                else {
                    return Ok(None);
                };
                let status = json_path(&stacks, "Stacks[0].StackStatus")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                if status.is_empty() || status.ends_with("_IN_PROGRESS") {
                    Ok(None)
                } else {
                    Ok(Some(status))
                }
            }
        })
        .await?;

    let status = match outcome {
        WaitOutcome::Ready(status) => status,
        WaitOutcome::TimedOut => {
            return Ok(Some(Failure::synthetic(
                "cloudformation",
                op,
                format!("stack {stack_name} did not reach a terminal status in time"),
            )));
        }
        WaitOutcome::Cancelled => return Ok(None),
    };

    if is_success_status(&status) {
        ctx.say(&format!("stack {stack_name} is {status}"));
        return Ok(None);
    }

    let summary = event_summary(ctx, &stack_name).await?;
    Ok(Some(Failure::synthetic(
        "cloudformation",
        op,
        format!("stack {stack_name} ended in {status}: {summary}"),
    )))
}

/// The interesting lines out of the last 15 stack events.
async fn event_summary(ctx: &Ctx, stack_name: &str) -> Result<String> {
    let Some(events) = ctx
        .run_aws_json(&[
            "cloudformation",
            "describe-stack-events",
            "--stack-name",
            stack_name,
            "--max-items",
            "15",
            "--output",
            "json",
        ])
        .await?
    else {
        return Ok("no event detail available".to_string());
    };

    let mut lines = Vec::new();
    if let Some(list) = events.get("StackEvents").and_then(Value::as_array) {
        for event in list.iter().take(15) {
            let status = event
                .get("ResourceStatus")
                .and_then(Value::as_str)
                .unwrap_or("");
            let reason = event
                .get("ResourceStatusReason")
                .and_then(Value::as_str)
                .unwrap_or("");
            let lowered = reason.to_ascii_lowercase();
            if status.contains("FAILED")
                || lowered.contains("cidr")
                || lowered.contains("invalid")
            {
                let resource = event
                    .get("LogicalResourceId")
                    .and_then(Value::as_str)
                    .unwrap_or("?");
                lines.push(format!("{resource} {status}: {reason}"));
            }
        }
    }
    if lines.is_empty() {
        Ok("no failing events captured".to_string())
    } else {
        Ok(lines.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clk_core::FailureCategory;

    fn cidr_failure(op: &str, message: &str) -> Failure {
        Failure {
            service: "cloudformation".to_string(),
            op: op.to_string(),
            code: None,
            category: FailureCategory::Validation,
            message: message.to_string(),
        }
    }

    #[test]
    fn detects_cidr_failures() {
        assert!(is_cidr_failure(&cidr_failure(
            "create-stack",
            "The CIDR '10.0.1.0/24' conflicts with another subnet"
        )));
        assert!(is_cidr_failure(&cidr_failure(
            "create-stack",
            "SubnetA CREATE_FAILED: invalid CIDR block"
        )));
        assert!(!is_cidr_failure(&cidr_failure(
            "create-stack",
            "role is not authorized"
        )));
    }

    #[test]
    fn success_statuses() {
        assert!(is_success_status("CREATE_COMPLETE"));
        assert!(is_success_status("UPDATE_COMPLETE"));
        assert!(!is_success_status("ROLLBACK_COMPLETE"));
        assert!(!is_success_status("UPDATE_ROLLBACK_COMPLETE"));
        assert!(!is_success_status("DELETE_COMPLETE"));
    }
}
