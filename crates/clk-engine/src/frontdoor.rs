//! HTTPS front door: an idempotent CloudFront distribution in front of the
//! ALB. Reuse is keyed on a stable comment derived from the deploy, so
//! re-applying a plan never creates a second distribution.

use crate::learn::json_path;
use crate::waiters::{WaitOutcome, Waiter};
use crate::Ctx;
use anyhow::Result;
use clk_core::BindingMap;
use serde_json::{Value, json};
use sha1::{Digest, Sha1};
use tracing::debug;

/// AWS-managed cache policy "CachingDisabled".
const CACHING_DISABLED_POLICY: &str = "4135ea2d-6df8-44a3-9df3-4b5a84be39ad";
/// AWS-managed origin-request policy "AllViewer".
const ALL_VIEWER_POLICY: &str = "216adef6-5c7f-47e4-b989-5492eafa07d3";

const COMMENT_MAX: usize = 128;

/// Whether this run should get a front door.
pub fn applies(ctx: &Ctx, bindings: &BindingMap) -> bool {
    !ctx.destroyer && bindings.contains("ALB_DNS")
}

/// Stable distribution comment for this deploy.
pub fn distribution_comment(bindings: &BindingMap, question: &str) -> String {
    let alb = bindings.get("ALB_DNS").unwrap_or_default();
    let tg = bindings.get("TG_ARN").unwrap_or_default();
    let full = format!("{alb} | {tg} | {question}");
    full.chars().take(COMMENT_MAX).collect()
}

/// Ensure a deployed distribution exists and bind `CLOUDFRONT_ID`,
/// `CLOUDFRONT_DOMAIN`, `HTTPS_URL`.
pub async fn run(ctx: &Ctx, bindings: &mut BindingMap) -> Result<()> {
    let alb_dns = bindings.get("ALB_DNS").expect("checked by applies").to_string();
    let comment = distribution_comment(bindings, &ctx.question);

    if let Some((id, domain)) = find_by_comment(ctx, &comment).await? {
        ctx.say(&format!("reusing CloudFront distribution {id}"));
        wait_deployed(ctx, &id).await?;
        bind_results(bindings, &id, &domain);
        return Ok(());
    }

    ctx.say("creating a CloudFront distribution in front of the ALB");
    let config = distribution_config(&alb_dns, &comment);
    let Some(created) = ctx
        .run_aws_json(&[
            "cloudfront",
            "create-distribution",
            "--distribution-config",
            &config.to_string(),
            "--output",
            "json",
        ])
        .await?
    else {
        anyhow::bail!("cloudfront create-distribution failed");
    };

    let id = json_path(&created, "Distribution.Id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let domain = json_path(&created, "Distribution.DomainName")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if id.is_empty() || domain.is_empty() {
        anyhow::bail!("cloudfront create-distribution returned no id/domain");
    }
    wait_deployed(ctx, &id).await?;
    bind_results(bindings, &id, &domain);
    ctx.say(&format!("https front door ready: https://{domain}"));
    Ok(())
}

fn bind_results(bindings: &mut BindingMap, id: &str, domain: &str) {
    bindings.set("CLOUDFRONT_ID", id.to_string());
    bindings.set("CLOUDFRONT_DOMAIN", domain.to_string());
    bindings.set("HTTPS_URL", format!("https://{domain}"));
}

/// Search existing distributions for our comment.
async fn find_by_comment(ctx: &Ctx, comment: &str) -> Result<Option<(String, String)>> {
    let Some(list) = ctx
        .run_aws_json(&["cloudfront", "list-distributions", "--output", "json"])
        .await?
    else {
        return Ok(None);
    };
    let Some(items) = json_path(&list, "DistributionList.Items").and_then(Value::as_array) else {
        return Ok(None);
    };
    for item in items {
        if item.get("Comment").and_then(Value::as_str) == Some(comment) {
            let id = item.get("Id").and_then(Value::as_str).unwrap_or_default();
            let domain = item
                .get("DomainName")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !id.is_empty() {
                return Ok(Some((id.to_string(), domain.to_string())));
            }
        }
    }
    Ok(None)
}

/// Wait for the distribution to report `Deployed`.
async fn wait_deployed(ctx: &Ctx, id: &str) -> Result<()> {
    let waiter = Waiter {
        description: "cloudfront deployed",
        poll_interval: ctx.timings.frontdoor_poll,
        deadline: ctx.timings.frontdoor_deadline,
    };
    let outcome = waiter
        .run(&ctx.cancel, || async move {
            let Some(dist) = ctx
                .run_aws_json(&["cloudfront", "get-distribution", "--id", id, "--output", "json"])
                .await?
            else {
                return Ok(None);
            };
            let status = json_path(&dist, "Distribution.Status")
                .and_then(Value::as_str)
                .unwrap_or("");
            Ok((status == "Deployed").then_some(()))
        })
        .await?;
    if outcome == WaitOutcome::TimedOut {
        // The distribution will finish on its own; report and move on.
        ctx.say(&format!("distribution {id} is still deploying; not waiting further"));
    }
    debug!(id, ?outcome, "front door wait finished");
    Ok(())
}

/// Distribution config: HTTP-only origin at the ALB, viewers redirected to
/// HTTPS, managed no-cache + all-viewer policies.
fn distribution_config(alb_dns: &str, comment: &str) -> Value {
    let caller_reference = {
        let mut hasher = Sha1::new();
        hasher.update(comment.as_bytes());
        format!("clanker-{}", hex::encode(&hasher.finalize()[..8]))
    };
    json!({
        "CallerReference": caller_reference,
        "Comment": comment,
        "Enabled": true,
        "Origins": {
            "Quantity": 1,
            "Items": [{
                "Id": "alb-origin",
                "DomainName": alb_dns,
                "CustomOriginConfig": {
                    "HTTPPort": 80,
                    "HTTPSPort": 443,
                    "OriginProtocolPolicy": "http-only"
                }
            }]
        },
        "DefaultCacheBehavior": {
            "TargetOriginId": "alb-origin",
            "ViewerProtocolPolicy": "redirect-to-https",
            "CachePolicyId": CACHING_DISABLED_POLICY,
            "OriginRequestPolicyId": ALL_VIEWER_POLICY,
            "AllowedMethods": {
                "Quantity": 7,
                "Items": ["GET", "HEAD", "OPTIONS", "PUT", "POST", "PATCH", "DELETE"],
                "CachedMethods": { "Quantity": 2, "Items": ["GET", "HEAD"] }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comment_is_stable_and_bounded() {
        let mut bindings = BindingMap::new();
        bindings.set("ALB_DNS", "alb-1.us-east-1.elb.amazonaws.com");
        bindings.set("TG_ARN", "arn:aws:elasticloadbalancing:us-east-1:1:targetgroup/tg/x");
        let a = distribution_comment(&bindings, "deploy my app");
        let b = distribution_comment(&bindings, "deploy my app");
        assert_eq!(a, b);
        assert!(a.starts_with("alb-1.us-east-1.elb.amazonaws.com | "));

        let long_question = "x".repeat(500);
        let c = distribution_comment(&bindings, &long_question);
        assert_eq!(c.chars().count(), COMMENT_MAX);
    }

    #[test]
    fn config_uses_managed_policies_and_http_only_origin() {
        let config = distribution_config("alb.example.com", "comment");
        assert_eq!(config["Origins"]["Items"][0]["DomainName"], "alb.example.com");
        assert_eq!(
            config["Origins"]["Items"][0]["CustomOriginConfig"]["OriginProtocolPolicy"],
            "http-only"
        );
        assert_eq!(
            config["DefaultCacheBehavior"]["ViewerProtocolPolicy"],
            "redirect-to-https"
        );
        assert_eq!(config["DefaultCacheBehavior"]["CachePolicyId"], CACHING_DISABLED_POLICY);
        assert_eq!(
            config["DefaultCacheBehavior"]["OriginRequestPolicyId"],
            ALL_VIEWER_POLICY
        );
    }

    #[test]
    fn caller_reference_is_deterministic_per_comment() {
        let a = distribution_config("alb", "same comment");
        let b = distribution_config("alb", "same comment");
        let c = distribution_config("alb", "different comment");
        assert_eq!(a["CallerReference"], b["CallerReference"]);
        assert_ne!(a["CallerReference"], c["CallerReference"]);
    }
}
