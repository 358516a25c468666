//! Learning bindings from successful command output.
//!
//! Two mechanisms: the command's explicit `produces` map (restricted JSON
//! paths), and a table of heuristic extractors keyed on `(service, op)` that
//! pull well-known fields into canonical keys. Extractors are data, not
//! code: one interpreter evaluates them, so adding a learner is a table edit.

use crate::argops::flag_value;
use clk_core::{BindingMap, PlanCommand};
use serde_json::Value;
use tracing::debug;

/// One declarative extraction over a successful command's output.
#[derive(Debug, Clone, Copy)]
pub enum Extract {
    /// Store the value at `path` under `key`.
    Path { key: &'static str, path: &'static str },
    /// `ec2 create-security-group`: GroupId plus name-derived keys.
    SecurityGroup,
    /// `ec2 create-subnet`: slot the id by declared purpose.
    SubnetSlot,
    /// `ssm get-parameter(s)`: an `ami-…` value, JSON or `--output text`.
    TextAmi,
    /// `cloudformation describe-stacks`: lift stack outputs into bindings.
    StackOutputs,
}

/// Heuristic learner table. Order within a slice matters: earlier extractors
/// fill keys that later ones respect via `set_if_empty`.
const LEARNERS: &[((&str, &str), &[Extract])] = &[
    (
        ("ec2", "create-vpc"),
        &[
            Extract::Path { key: "VPC_ID", path: "Vpc.VpcId" },
            Extract::Path { key: "VPC_CIDR", path: "Vpc.CidrBlock" },
        ],
    ),
    (("ec2", "create-security-group"), &[Extract::SecurityGroup]),
    (("ec2", "create-subnet"), &[Extract::SubnetSlot]),
    (
        ("ec2", "create-internet-gateway"),
        &[Extract::Path { key: "IGW_ID", path: "InternetGateway.InternetGatewayId" }],
    ),
    (
        ("ec2", "create-route-table"),
        &[Extract::Path { key: "RTB_ID", path: "RouteTable.RouteTableId" }],
    ),
    (
        ("ec2", "allocate-address"),
        &[Extract::Path { key: "EIP_ALLOC_ID", path: "AllocationId" }],
    ),
    (
        ("ec2", "create-nat-gateway"),
        &[Extract::Path { key: "NAT_GW_ID", path: "NatGateway.NatGatewayId" }],
    ),
    (
        ("ec2", "run-instances"),
        &[Extract::Path { key: "INSTANCE_ID", path: "Instances[0].InstanceId" }],
    ),
    (
        ("elbv2", "create-load-balancer"),
        &[
            Extract::Path { key: "ALB_ARN", path: "LoadBalancers[0].LoadBalancerArn" },
            Extract::Path { key: "ALB_DNS", path: "LoadBalancers[0].DNSName" },
        ],
    ),
    (
        ("elbv2", "create-target-group"),
        &[Extract::Path { key: "TG_ARN", path: "TargetGroups[0].TargetGroupArn" }],
    ),
    (
        ("ecr", "create-repository"),
        &[Extract::Path { key: "ECR_URI", path: "repository.repositoryUri" }],
    ),
    (
        ("iam", "create-role"),
        &[
            Extract::Path { key: "ROLE_ARN", path: "Role.Arn" },
            Extract::Path { key: "ROLE_NAME", path: "Role.RoleName" },
        ],
    ),
    (
        ("lambda", "create-function"),
        &[Extract::Path { key: "LAMBDA_ARN", path: "FunctionArn" }],
    ),
    (
        ("sts", "get-caller-identity"),
        &[Extract::Path { key: "ACCOUNT_ID", path: "Account" }],
    ),
    (
        ("rds", "create-db-instance"),
        &[Extract::Path { key: "DB_ID", path: "DBInstance.DBInstanceIdentifier" }],
    ),
    (("ssm", "get-parameter"), &[Extract::TextAmi]),
    (("ssm", "get-parameters"), &[Extract::TextAmi]),
    (("cloudformation", "describe-stacks"), &[Extract::StackOutputs]),
    (
        ("cloudfront", "create-distribution"),
        &[
            Extract::Path { key: "CLOUDFRONT_ID", path: "Distribution.Id" },
            Extract::Path { key: "CLOUDFRONT_DOMAIN", path: "Distribution.DomainName" },
        ],
    ),
];

/// Learn bindings from a successful execution: explicit `produces` first,
/// then the heuristic table for the dispatched `(service, op)`.
pub fn learn(
    cmd: &PlanCommand,
    dispatched_args: &[String],
    output: &str,
    bindings: &mut BindingMap,
) {
    let json = parse_json_lenient(output);

    if let (Some(produces), Some(json)) = (&cmd.produces, &json) {
        for (key, path) in produces {
            if let Some(value) = json_path(json, path).and_then(value_to_string) {
                debug!(key, %value, "produces binding");
                bindings.set(key, value);
            }
        }
    }

    let service = dispatched_args.first().map(String::as_str).unwrap_or("");
    let op = dispatched_args.get(1).map(String::as_str).unwrap_or("");
    let Some((_, extractors)) = LEARNERS.iter().find(|((s, o), _)| *s == service && *o == op)
    else {
        return;
    };

    for extract in *extractors {
        apply_extract(extract, dispatched_args, output, json.as_ref(), bindings);
    }
}

fn apply_extract(
    extract: &Extract,
    args: &[String],
    output: &str,
    json: Option<&Value>,
    bindings: &mut BindingMap,
) {
    match extract {
        Extract::Path { key, path } => {
            if let Some(value) = json.and_then(|j| json_path(j, path)).and_then(value_to_string)
            {
                bindings.set_if_empty(key, value);
            }
        }
        Extract::SecurityGroup => learn_security_group(args, json, bindings),
        Extract::SubnetSlot => learn_subnet_slot(args, json, bindings),
        Extract::TextAmi => learn_ami(args, output, json, bindings),
        Extract::StackOutputs => learn_stack_outputs(json, bindings),
    }
}

/// Canonical SG slots, tried in order when the group name names no purpose.
const SG_SLOTS: &[&str] = &["SG_ALB_ID", "SG_APP_ID", "SG_RDS_ID"];

/// Group-name keywords → canonical slot. Fixed names win over slotting.
const SG_PURPOSES: &[(&[&str], &str)] = &[
    (&["alb", "elb", "lb"], "SG_ALB_ID"),
    (&["rds", "db", "database"], "SG_RDS_ID"),
    (&["app", "web", "ec2", "instance"], "SG_APP_ID"),
];

fn learn_security_group(args: &[String], json: Option<&Value>, bindings: &mut BindingMap) {
    let Some(group_id) = json
        .and_then(|j| json_path(j, "GroupId"))
        .and_then(value_to_string)
    else {
        return;
    };
    bindings.set_if_empty("SG_ID", group_id.clone());

    let name = flag_value(args, "--group-name").unwrap_or("").to_ascii_lowercase();
    let words: Vec<&str> = name
        .split(['-', '_', '.'])
        .filter(|w| !w.is_empty() && *w != "sg" && *w != "group")
        .collect();

    // Fixed purpose names first, then the first empty canonical slot.
    let slot = SG_PURPOSES
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| words.contains(n)))
        .map(|(_, slot)| *slot)
        .or_else(|| SG_SLOTS.iter().copied().find(|s| bindings.get(s).is_none()));
    if let Some(slot) = slot {
        bindings.set_if_empty(slot, group_id.clone());
    }

    // Name-derived key, e.g. "alb-sg" → SG_ALB_ID.
    if !words.is_empty() {
        let derived = format!("SG_{}_ID", words.join("_").to_ascii_uppercase());
        bindings.set_if_empty(&derived, group_id);
    }
}

fn learn_subnet_slot(args: &[String], json: Option<&Value>, bindings: &mut BindingMap) {
    let Some(subnet_id) = json
        .and_then(|j| json_path(j, "Subnet.SubnetId"))
        .and_then(value_to_string)
    else {
        return;
    };
    bindings.set_if_empty("SUBNET_ID", subnet_id.clone());

    let blob = args.join(" ").to_ascii_lowercase();
    let slots: &[&str] = if blob.contains("priv") {
        &["SUB_PRIV_1_ID", "SUB_PRIV_2_ID"]
    } else {
        &["SUB_PUB_1_ID", "SUB_PUB_2_ID"]
    };
    if let Some(slot) = slots.iter().find(|s| bindings.get(s).is_none()) {
        bindings.set_if_empty(slot, subnet_id);
    }
}

fn learn_ami(args: &[String], output: &str, json: Option<&Value>, bindings: &mut BindingMap) {
    let from_json = json.and_then(|j| {
        json_path(j, "Parameter.Value")
            .or_else(|| json_path(j, "Parameters[0].Value"))
            .and_then(value_to_string)
    });
    let value = from_json.or_else(|| {
        if flag_value(args, "--output") == Some("text") {
            output
                .split_whitespace()
                .find(|t| t.starts_with("ami-"))
                .map(String::from)
        } else {
            None
        }
    });
    if let Some(value) = value.filter(|v| v.starts_with("ami-")) {
        bindings.set_if_empty("AMI_ID", value);
    }
}

fn learn_stack_outputs(json: Option<&Value>, bindings: &mut BindingMap) {
    let Some(outputs) = json
        .and_then(|j| json_path(j, "Stacks[0].Outputs"))
        .and_then(Value::as_array)
    else {
        return;
    };
    for output in outputs {
        let (Some(key), Some(value)) = (
            output.get("OutputKey").and_then(Value::as_str),
            output.get("OutputValue").and_then(Value::as_str),
        ) else {
            continue;
        };
        bindings.set_if_empty(&upper_snake(key), value.to_string());
    }
}

/// `AlbDnsName` → `ALB_DNS_NAME`.
fn upper_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c.is_ascii_uppercase() && prev_lower {
            out.push('_');
        }
        prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        if c == '-' || c == ' ' {
            out.push('_');
        } else {
            out.push(c.to_ascii_uppercase());
        }
    }
    out
}

/// Parse output that should be JSON but may carry stray stream lines around
/// the document.
pub fn parse_json_lenient(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    let start = trimmed.find(['{', '['])?;
    serde_json::from_str(clk_ai::clean_json(&trimmed[start..]).as_str()).ok()
}

/// Evaluate a restricted JSON path: dotted names, each with optional
/// `[index]` suffixes (`Instances[0].InstanceId`, `Stacks[0].Outputs`).
pub fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        let (name, indices) = split_segment(segment)?;
        if !name.is_empty() {
            current = current.get(name)?;
        }
        for idx in indices {
            current = current.get(idx)?;
        }
    }
    Some(current)
}

/// `Outputs[0][1]` → `("Outputs", [0, 1])`.
fn split_segment(segment: &str) -> Option<(&str, Vec<usize>)> {
    let bracket = segment.find('[');
    let (name, rest) = match bracket {
        Some(pos) => (&segment[..pos], &segment[pos..]),
        None => (segment, ""),
    };
    let mut indices = Vec::new();
    let mut rest = rest;
    while !rest.is_empty() {
        let inner = rest.strip_prefix('[')?;
        let close = inner.find(']')?;
        indices.push(inner[..close].parse().ok()?);
        rest = &inner[close + 1..];
    }
    Some((name, indices))
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
