//! Failure taxonomy and the pure classification function.
//!
//! AWS CLIs report errors as `An error occurred (<Code>) when calling ...`.
//! The code, when present, is authoritative; otherwise a corpus of
//! case-insensitive substrings over the captured output decides the category.

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Unknown,
    NotFound,
    AlreadyExists,
    Conflict,
    AccessDenied,
    Throttled,
    Validation,
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::Conflict => "conflict",
            Self::AccessDenied => "access_denied",
            Self::Throttled => "throttled",
            Self::Validation => "validation",
        };
        f.write_str(s)
    }
}

/// One classified command failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub service: String,
    pub op: String,
    pub code: Option<String>,
    pub category: FailureCategory,
    pub message: String,
}

impl Failure {
    /// Classify a non-zero CLI exit from its captured merged output.
    pub fn from_output(service: &str, op: &str, output: &str) -> Self {
        let code = parse_error_code(output);
        let category = classify(code.as_deref(), output);
        Self {
            service: service.to_string(),
            op: op.to_string(),
            code,
            category,
            message: tail(output, 2000),
        }
    }

    /// Synthesized failure (e.g. from an async waiter's event summary).
    pub fn synthetic(service: &str, op: &str, message: String) -> Self {
        let code = parse_error_code(&message);
        let category = classify(code.as_deref(), &message);
        Self {
            service: service.to_string(),
            op: op.to_string(),
            code,
            category,
            message,
        }
    }

    pub fn code_or_category(&self) -> String {
        self.code
            .clone()
            .unwrap_or_else(|| self.category.to_string())
    }
}

/// Keep the tail of long output; error text is almost always at the end.
fn tail(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

/// Extract `<Code>` from the `An error occurred (<Code>)` pattern.
pub fn parse_error_code(output: &str) -> Option<String> {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(r"An error occurred \(([A-Za-z0-9_.]+)\)").expect("static regex")
    });
    re.captures(output)
        .map(|caps| caps[1].to_string())
}

const NOT_FOUND_NEEDLES: &[&str] = &[
    "notfound",
    "nosuchentity",
    "nosuchbucket",
    "nosuchkey",
    "does not exist",
    "cannot be found",
    "resourcenotfound",
];

const ALREADY_EXISTS_NEEDLES: &[&str] = &[
    "alreadyexists",
    "already exists",
    "entityalreadyexists",
    "duplicate",
    "bucketalreadyownedbyyou",
];

const THROTTLED_NEEDLES: &[&str] = &[
    "throttling",
    "throttled",
    "rate exceeded",
    "toomanyrequests",
    "requestlimitexceeded",
    "slowdown",
];

const CONFLICT_NEEDLES: &[&str] = &[
    "dependencyviolation",
    "deleteconflict",
    "resourceinuse",
    "conflict",
    "currently in use",
];

const ACCESS_DENIED_NEEDLES: &[&str] = &[
    "accessdenied",
    "unauthorizedoperation",
    "not authorized",
    "forbidden",
    "explicit deny",
];

const VALIDATION_NEEDLES: &[&str] = &[
    "validationerror",
    "validation error",
    "invalidparameter",
    "invalid parameter",
    "invalidsubnet",
    "invalidrequest",
    "malformed",
    "missing required",
];

/// Pure classification over `(code, lowered message)`. The parsed error code
/// wins over substring signals from the surrounding text.
pub fn classify(code: Option<&str>, message: &str) -> FailureCategory {
    if let Some(code) = code {
        let lowered = code.to_ascii_lowercase();
        if let Some(cat) = match_needles(&lowered) {
            return cat;
        }
    }
    let lowered = message.to_ascii_lowercase();
    match_needles(&lowered).unwrap_or(FailureCategory::Unknown)
}

fn match_needles(lowered: &str) -> Option<FailureCategory> {
    // Throttling first: "Rate exceeded" often appears inside otherwise
    // unrelated error text and must win for the retry tier to fire.
    if THROTTLED_NEEDLES.iter().any(|n| lowered.contains(n)) {
        return Some(FailureCategory::Throttled);
    }
    if ALREADY_EXISTS_NEEDLES.iter().any(|n| lowered.contains(n)) {
        return Some(FailureCategory::AlreadyExists);
    }
    if NOT_FOUND_NEEDLES.iter().any(|n| lowered.contains(n)) {
        return Some(FailureCategory::NotFound);
    }
    if CONFLICT_NEEDLES.iter().any(|n| lowered.contains(n)) {
        return Some(FailureCategory::Conflict);
    }
    if ACCESS_DENIED_NEEDLES.iter().any(|n| lowered.contains(n)) {
        return Some(FailureCategory::AccessDenied);
    }
    if VALIDATION_NEEDLES.iter().any(|n| lowered.contains(n)) {
        return Some(FailureCategory::Validation);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aws_error_code() {
        let out = "An error occurred (EntityAlreadyExists) when calling the CreateRole operation: Role r exists";
        assert_eq!(parse_error_code(out).as_deref(), Some("EntityAlreadyExists"));
    }

    #[test]
    fn parses_dotted_error_code() {
        let out = "An error occurred (InvalidSubnet.Range) when calling AssociateVpcCidrBlock";
        assert_eq!(parse_error_code(out).as_deref(), Some("InvalidSubnet.Range"));
    }

    #[test]
    fn code_takes_precedence_over_substrings() {
        // Message mentions "does not exist" but the code says throttled.
        let cat = classify(Some("Throttling"), "the resource does not exist");
        assert_eq!(cat, FailureCategory::Throttled);
    }

    #[test]
    fn classifies_from_substrings_without_code() {
        assert_eq!(
            classify(None, "Security group sg-1 does not exist"),
            FailureCategory::NotFound
        );
        assert_eq!(
            classify(None, "role with name r already exists"),
            FailureCategory::AlreadyExists
        );
        assert_eq!(classify(None, "Rate exceeded"), FailureCategory::Throttled);
        assert_eq!(
            classify(None, "DependencyViolation: resource has a dependent object"),
            FailureCategory::Conflict
        );
        assert_eq!(
            classify(None, "User is not authorized to perform iam:CreateRole"),
            FailureCategory::AccessDenied
        );
        assert_eq!(
            classify(None, "1 validation error detected: invalid value"),
            FailureCategory::Validation
        );
        assert_eq!(classify(None, "segfault"), FailureCategory::Unknown);
    }

    #[test]
    fn classifies_invalid_subnet_range_as_validation() {
        let cat = classify(Some("InvalidSubnet.Range"), "");
        assert_eq!(cat, FailureCategory::Validation);
    }

    #[test]
    fn failure_from_output_carries_code_and_category() {
        let out = "An error occurred (BucketAlreadyExists) when calling CreateBucket";
        let f = Failure::from_output("s3api", "create-bucket", out);
        assert_eq!(f.code.as_deref(), Some("BucketAlreadyExists"));
        assert_eq!(f.category, FailureCategory::AlreadyExists);
        assert_eq!(f.service, "s3api");
    }

    #[test]
    fn long_output_is_tail_trimmed() {
        let noise = "x".repeat(5000) + "An error occurred (Throttling) tail";
        let f = Failure::from_output("ec2", "describe-vpcs", &noise);
        assert!(f.message.len() <= 2000);
        assert!(f.message.ends_with("tail"));
    }
}
