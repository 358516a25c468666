//! Post-deploy autofix: when the ALB reports no healthy targets after an
//! apply, diagnose the instance over SSM and restart the container with a
//! corrected bind address.

use crate::learn::{json_path, parse_json_lenient};
use crate::waiters::{WaitOutcome, Waiter, sleep_cancellable};
use crate::Ctx;
use anyhow::{Result, bail};
use clk_core::BindingMap;
use futures::future::join_all;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Marker the diagnose script prints when the app only listens on loopback.
const LOOPBACK_MARKER: &str = "CLANKER_LOOPBACK_ONLY=1";

/// Whether this run produced something worth verifying.
pub fn applies(ctx: &Ctx, bindings: &BindingMap) -> bool {
    !ctx.destroyer
        && bindings.contains("INSTANCE_ID")
        && bindings.contains("TG_ARN")
        && bindings.contains("ALB_DNS")
}

/// Run the verification + autofix sequence. Errors mean the deploy is not
/// serving and could not be repaired.
pub async fn run(ctx: &Ctx, bindings: &BindingMap) -> Result<()> {
    let tg_arn = bindings.get("TG_ARN").expect("checked by applies");
    let instance_id = bindings.get("INSTANCE_ID").expect("checked by applies");

    ctx.say("verifying target health behind the load balancer");
    if wait_for_healthy(ctx, tg_arn, ctx.timings.initial_health_deadline).await? {
        ctx.say("target is healthy");
        return Ok(());
    }

    ctx.say("no healthy targets; running SSM diagnosis on the instance");
    if let Some(oracle_notes) = swarm_diagnose(ctx, bindings).await {
        for note in oracle_notes {
            ctx.say(&format!("diagnosis: {note}"));
        }
    }

    let diagnose_output = run_ssm_script(
        ctx,
        instance_id,
        &diagnose_script(&ctx.question, &ctx.region, bindings),
    )
    .await?;
    let loopback_only = diagnose_output.contains(LOOPBACK_MARKER);
    if loopback_only {
        ctx.say("app is bound to loopback only; restarting with 0.0.0.0");
    } else if ctx.aggressive_autofix {
        ctx.say("no loopback evidence, but aggressive autofix is on; restarting anyway");
    } else {
        debug!("diagnosis found no loopback bind and aggressive mode is off");
    }

    if loopback_only || ctx.aggressive_autofix {
        run_ssm_script(ctx, instance_id, &restart_script(&ctx.question, bindings)).await?;
    }

    ctx.say("waiting for the target to become healthy");
    if wait_for_healthy(ctx, tg_arn, ctx.timings.final_health_deadline).await? {
        ctx.say("target recovered");
        return Ok(());
    }
    bail!("target group still has no healthy targets after autofix")
}

/// Poll target health until any target is healthy or the deadline passes.
async fn wait_for_healthy(ctx: &Ctx, tg_arn: &str, deadline: Duration) -> Result<bool> {
    let waiter = Waiter {
        description: "alb target health",
        poll_interval: ctx.timings.health_poll,
        deadline,
    };
    let outcome = waiter
        .run(&ctx.cancel, || async move {
            Ok(any_healthy(ctx, tg_arn).await?.then_some(()))
        })
        .await?;
    Ok(matches!(outcome, WaitOutcome::Ready(())))
}

async fn any_healthy(ctx: &Ctx, tg_arn: &str) -> Result<bool> {
    let Some(health) = ctx
        .run_aws_json(&[
            "elbv2",
            "describe-target-health",
            "--target-group-arn",
            tg_arn,
            "--output",
            "json",
        ])
        .await?
    else {
        return Ok(false);
    };
    let healthy = health
        .get("TargetHealthDescriptions")
        .and_then(Value::as_array)
        .map(|targets| {
            targets.iter().any(|t| {
                json_path(t, "TargetHealth.State").and_then(Value::as_str) == Some("healthy")
            })
        })
        .unwrap_or(false);
    Ok(healthy)
}

/// Send an `AWS-RunShellScript` document and wait for its invocation to
/// finish. Returns combined stdout+stderr of the remote script.
async fn run_ssm_script(ctx: &Ctx, instance_id: &str, script_lines: &[String]) -> Result<String> {
    let parameters = serde_json::json!({ "commands": script_lines }).to_string();
    let Some(sent) = ctx
        .run_aws_json(&[
            "ssm",
            "send-command",
            "--instance-ids",
            instance_id,
            "--document-name",
            "AWS-RunShellScript",
            "--parameters",
            &parameters,
            "--output",
            "json",
        ])
        .await?
    else {
        bail!("ssm send-command failed");
    };
    let Some(command_id) = json_path(&sent, "Command.CommandId")
        .and_then(Value::as_str)
        .map(String::from)
    else {
        bail!("ssm send-command returned no command id");
    };
    debug!(command_id, "ssm command sent");

    let waiter = Waiter {
        description: "ssm command invocation",
        poll_interval: ctx.timings.ssm_poll,
        deadline: ctx.timings.ssm_deadline,
    };
    let outcome = waiter
        .run(&ctx.cancel, || {
            let command_id = command_id.clone();
            async move {
                let out = ctx
                    .run_aws(&[
                        "ssm",
                        "get-command-invocation",
                        "--command-id",
                        &command_id,
                        "--instance-id",
                        instance_id,
                        "--output",
                        "json",
                    ])
                    .await?;
                // InvocationDoesNotExist right after send is normal.
                let Some(invocation) = parse_json_lenient(&out.merged).filter(|_| out.success())
                else {
                    return Ok(None);
                };
                let status = invocation
                    .get("Status")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if matches!(status, "Pending" | "InProgress" | "Delayed" | "") {
                    return Ok(None);
                }
                let stdout = invocation
                    .get("StandardOutputContent")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let stderr = invocation
                    .get("StandardErrorContent")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                Ok(Some((status.to_string(), format!("{stdout}\n{stderr}"))))
            }
        })
        .await?;

    match outcome {
        WaitOutcome::Ready((status, output)) => {
            if status != "Success" {
                ctx.say(&format!("ssm script ended with status {status}"));
            }
            Ok(output)
        }
        WaitOutcome::TimedOut => bail!("ssm command did not finish in time"),
        WaitOutcome::Cancelled => bail!("cancelled while waiting for ssm command"),
    }
}

/// The diagnosis script: ensure tooling, refresh the image, inspect listening
/// sockets for loopback-only binds, and dump container logs.
fn diagnose_script(question: &str, default_region: &str, bindings: &BindingMap) -> Vec<String> {
    let port = bindings.get("APP_PORT").unwrap_or("8080");
    let image = crate::glue::userdata::image_source(bindings, question);
    let mut lines = vec![
        "set -x".to_string(),
        "command -v docker >/dev/null 2>&1 || yum install -y docker || dnf install -y docker || apt-get install -y docker.io".to_string(),
        "systemctl start docker 2>/dev/null || service docker start 2>/dev/null || true".to_string(),
        "command -v aws >/dev/null 2>&1 || echo 'aws cli missing on instance'".to_string(),
    ];
    if image.contains(".ecr.") {
        let registry = image.split('/').next().unwrap_or_default().to_string();
        let region = image
            .split(".ecr.")
            .nth(1)
            .and_then(|rest| rest.split('.').next())
            .unwrap_or(default_region)
            .to_string();
        lines.push(format!(
            "aws ecr get-login-password --region {region} | docker login --username AWS --password-stdin {registry} || true"
        ));
    }
    lines.extend([
        format!("docker pull {image} || true"),
        format!("LISTEN=$(ss -ltn 2>/dev/null | grep ':{port} ' || netstat -ltn 2>/dev/null | grep ':{port} ' || true)"),
        "echo \"LISTEN=$LISTEN\"".to_string(),
        format!(
            "if [ -n \"$LISTEN\" ] && ! echo \"$LISTEN\" | grep -q '0.0.0.0:{port}\\|\\*:{port}\\|\\[::\\]:{port}'; then echo {LOOPBACK_MARKER}; fi"
        ),
        "CID=$(docker ps -q | head -n1)".to_string(),
        "if [ -n \"$CID\" ]; then docker logs --tail 50 $CID 2>&1; else echo 'no running container'; fi".to_string(),
    ]);
    lines
}

/// The restart script: capture the running container's env and image, remove
/// it, and re-run with an explicit non-loopback bind.
fn restart_script(question: &str, bindings: &BindingMap) -> Vec<String> {
    let port = bindings.get("APP_PORT").unwrap_or("8080");
    let image = crate::glue::userdata::image_source(bindings, question);
    vec![
        "set -x".to_string(),
        "CID=$(docker ps -q | head -n1)".to_string(),
        format!(
            "IMG=$(docker inspect --format '{{{{.Config.Image}}}}' $CID 2>/dev/null || echo {image})"
        ),
        "ENVS=$(docker inspect --format '{{range .Config.Env}}-e {{.}} {{end}}' $CID 2>/dev/null || true)".to_string(),
        "if [ -n \"$CID\" ]; then docker rm -f $CID; fi".to_string(),
        format!(
            "docker run -d --restart unless-stopped -p {port}:{port} $ENVS -e HOST=0.0.0.0 -e BIND=0.0.0.0 -e PORT={port} $IMG"
        ),
        "sleep 3".to_string(),
        "docker ps".to_string(),
    ]
}

/// Bounded diagnostic fan-out: up to three parallel model queries, joined
/// under one timeout. Purely advisory.
async fn swarm_diagnose(ctx: &Ctx, bindings: &BindingMap) -> Option<Vec<String>> {
    let oracle = ctx.oracle.clone()?;
    let lenses = [
        "security groups and network path",
        "container port binding and health-check path",
        "target group configuration",
    ];
    let asks = lenses.iter().map(|lens| {
        let oracle = oracle.clone();
        let prompt = format!(
            "An EC2-backed ALB deployment has no healthy targets.\n\
             Bindings: {}\n\
             In one sentence, name the most likely cause related to {lens}.",
            bindings.to_prompt_json()
        );
        async move { oracle.ask(&prompt).await.ok() }
    });

    match tokio::time::timeout(ctx.timings.swarm_timeout, join_all(asks)).await {
        Ok(answers) => {
            let notes: Vec<String> = answers
                .into_iter()
                .flatten()
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect();
            (!notes.is_empty()).then_some(notes)
        }
        Err(_) => {
            debug!("swarm diagnose timed out");
            None
        }
    }
}
