//! Deterministic glue: a rule table keyed on `(service, op, failure)` that
//! rewrites-and-retries, waits for async readiness, or performs a
//! compensating read before retrying. One attempt per rule; a rule that
//! cannot help falls through to the next healing tier.

pub mod cfn;
pub mod cidr;
pub mod iam;
pub mod lambda;
pub mod userdata;

use crate::argops::flag_value;
use crate::Ctx;
use anyhow::Result;
use clk_core::{BindingMap, Failure, FailureCategory};

/// What a glue rule did with a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum GlueOutcome {
    /// Args rewritten; the loop should retry the command.
    Rewritten(Vec<String>),
    /// The rule performed the work itself; the command is done.
    Resolved,
    /// No rule matched, or the matching rule could not help.
    NotApplicable,
}

/// Pre-dispatch preparation: rewrites that must happen before the command
/// first runs (inline Lambda packages, user-data synthesis).
pub fn prepare(ctx: &Ctx, bindings: &BindingMap, args: &mut Vec<String>) -> Result<()> {
    let service = args.first().cloned().unwrap_or_default();
    let op = args.get(1).cloned().unwrap_or_default();

    if service == "lambda" && op == "create-function" && lambda::needs_inline_zip(args) {
        ctx.say("synthesizing an in-memory deployment package for the function");
        *args = lambda::rewrite_with_inline_zip(args)?;
    }

    if service == "ec2" && op == "run-instances" && userdata::needs_rewrite(args) {
        ctx.say("generating instance bootstrap user-data");
        userdata::rewrite(args, bindings, &ctx.question, &ctx.region);
    }

    Ok(())
}

/// Apply the first matching rule for a classified failure.
pub async fn apply(
    ctx: &Ctx,
    bindings: &mut BindingMap,
    failure: &Failure,
    args: &[String],
) -> Result<GlueOutcome> {
    match (failure.service.as_str(), failure.op.as_str()) {
        ("ec2", "associate-vpc-cidr-block")
            if failure.code.as_deref() == Some("InvalidSubnet.Range")
                || failure.message.to_ascii_lowercase().contains("invalidsubnet.range") =>
        {
            cidr::fix_vpc_association(ctx, args).await
        }

        ("cloudformation", "create-stack") | ("cloudformation", "update-stack")
            if failure.category == FailureCategory::AlreadyExists
                || cfn::is_cidr_failure(failure) =>
        {
            cfn::fix_stack(ctx, bindings, failure, args).await
        }

        ("lambda", "create-function")
            if failure.category == FailureCategory::AlreadyExists =>
        {
            lambda::create_to_update(ctx, args).await
        }

        ("iam", "delete-role") if failure.category == FailureCategory::Conflict => {
            iam::fix_delete_role(ctx, args).await
        }

        // v1 apigateway delete pointed at a v2 API: fall back to the v2 CLI.
        ("apigateway", "delete-rest-api")
            if failure.category == FailureCategory::NotFound =>
        {
            let Some(api_id) = flag_value(args, "--rest-api-id") else {
                return Ok(GlueOutcome::NotApplicable);
            };
            ctx.say("rest API not found under apigateway v1; retrying as HTTP API");
            Ok(GlueOutcome::Rewritten(vec![
                "apigatewayv2".to_string(),
                "delete-api".to_string(),
                "--api-id".to_string(),
                api_id.to_string(),
            ]))
        }

        _ => Ok(GlueOutcome::NotApplicable),
    }
}

/// Post-success hook: async operations that report success immediately but
/// settle later. Returns a synthesized failure when the settled state is bad.
pub async fn post_success(ctx: &Ctx, args: &[String]) -> Result<Option<Failure>> {
    let service = args.first().map(String::as_str).unwrap_or("");
    let op = args.get(1).map(String::as_str).unwrap_or("");
    if service == "cloudformation" && (op == "create-stack" || op == "update-stack") {
        return cfn::wait_stack(ctx, op, args).await;
    }
    Ok(None)
}
