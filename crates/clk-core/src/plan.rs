//! Plan data model and input normalization.
//!
//! A plan is an ordered list of provider-CLI commands. Planner output is
//! accepted in three shapes: a full plan object, a bare command object, or an
//! array of command objects. Normalization strips a leading binary token from
//! `args` and canonicalizes `${NAME}` placeholders to `<NAME>` so the rest of
//! the engine only ever sees one placeholder syntax.

use crate::error::PlanError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cloud provider a plan targets. AWS is the default and the only provider
/// with deterministic glue; the others dispatch through the same actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Aws,
    Gcp,
    Azure,
    Cloudflare,
    Local,
}

impl Provider {
    /// Name of the CLI binary that actuates this provider.
    pub fn binary(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Gcp => "gcloud",
            Self::Azure => "az",
            Self::Cloudflare => "wrangler",
            Self::Local => "sh",
        }
    }
}

/// One reviewed CLI invocation.
///
/// `args` starts with `service operation` (e.g. `ec2 create-vpc ...`) and
/// never contains the binary name, `--profile`, `--region`, or a pager flag;
/// the dispatcher injects those.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanCommand {
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Binding key → restricted JSON path over the command's JSON output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produces: Option<BTreeMap<String, String>>,
}

impl PlanCommand {
    pub fn new(args: &[&str]) -> Self {
        Self {
            args: args.iter().map(|s| s.to_string()).collect(),
            reason: None,
            produces: None,
        }
    }

    /// First token, lowercased (`ec2`, `iam`, `local`, ...).
    pub fn service(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or("")
    }

    /// Second token (`create-vpc`, `sleep`, ...).
    pub fn op(&self) -> &str {
        self.args.get(1).map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(
        rename = "createdAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub commands: Vec<PlanCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

fn default_version() -> u32 {
    1
}

impl Plan {
    /// Effective provider (AWS when untagged).
    pub fn provider(&self) -> Provider {
        self.provider.unwrap_or_default()
    }

    /// Parse planner output, accepting a plan object, a bare command object,
    /// or an array of command objects, then normalize.
    pub fn from_json(text: &str) -> Result<Plan, PlanError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(PlanError::InvalidJson)?;

        let is_plan_object = value
            .as_object()
            .is_some_and(|map| map.contains_key("commands"));
        let is_command_object = value
            .as_object()
            .is_some_and(|map| map.contains_key("args"));

        let mut plan = if is_plan_object {
            serde_json::from_value::<Plan>(value).map_err(PlanError::MalformedPlan)?
        } else if is_command_object {
            let cmd: PlanCommand =
                serde_json::from_value(value).map_err(PlanError::MalformedCommand)?;
            Plan::single(cmd)
        } else if value.is_array() {
            let cmds: Vec<PlanCommand> =
                serde_json::from_value(value).map_err(PlanError::MalformedCommandArray)?;
            let mut plan = Plan::single(PlanCommand::new(&[]));
            plan.commands = cmds;
            plan
        } else {
            return Err(PlanError::UnrecognizedShape);
        };

        plan.normalize();
        Ok(plan)
    }

    fn single(cmd: PlanCommand) -> Plan {
        Plan {
            version: default_version(),
            created_at: None,
            provider: None,
            question: String::new(),
            summary: String::new(),
            commands: vec![cmd],
            notes: None,
        }
    }

    /// In-place normalization. Idempotent: normalizing a normalized plan is a
    /// no-op, so parse → emit → parse is a fixed point.
    pub fn normalize(&mut self) {
        self.commands.retain(|c| !c.args.is_empty());
        for cmd in &mut self.commands {
            if matches!(
                cmd.args.first().map(String::as_str),
                Some("aws") | Some("gcloud") | Some("az")
            ) {
                cmd.args.remove(0);
            }
            for arg in &mut cmd.args {
                *arg = canonicalize_placeholders(arg);
            }
        }
    }
}

/// Rewrite every `${NAME}` occurrence to `<NAME>`.
fn canonicalize_placeholders(arg: &str) -> String {
    if !arg.contains("${") {
        return arg.to_string();
    }
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if after[..end].chars().all(|c| c.is_ascii_alphanumeric() || c == '_') => {
                out.push('<');
                out.push_str(&after[..end]);
                out.push('>');
                rest = &after[end + 1..];
            }
            _ => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
