//! Idempotency no-op policy: failures that mean "the world is already the
//! way the plan wants it".

use clk_core::{Failure, FailureCategory};

/// Operation prefixes whose not-found failure means the target is already
/// gone.
const ABSENT_OK_PREFIXES: &[&str] = &["delete", "remove", "detach", "disassociate"];

/// Decide whether a classified failure is semantically a success. Returns the
/// reason to surface to the user, or `None` to keep healing.
pub fn should_ignore(failure: &Failure, args: &[String]) -> Option<&'static str> {
    let service = failure.service.as_str();
    let op = failure.op.as_str();
    let _ = args;

    if failure.category == FailureCategory::NotFound {
        // v1 apigateway delete against a v2 API id: not a no-op, glue must
        // fall back to the v2 delete.
        if service == "apigateway" && op == "delete-rest-api" {
            return None;
        }
        if ABSENT_OK_PREFIXES.iter().any(|p| op.starts_with(p)) {
            return Some("target already absent");
        }
        // Revoking rules on a security group that was already deleted.
        if service == "ec2" && op.starts_with("revoke-security-group") {
            return Some("security group already gone");
        }
    }

    if failure.category == FailureCategory::AlreadyExists {
        // Stack create must fall through to the update-stack glue.
        if service == "cloudformation" && op == "create-stack" {
            return None;
        }
        // BucketAlreadyExists means the global name belongs to another
        // account; only BucketAlreadyOwnedByYou is a true no-op.
        if (service == "s3api" || service == "s3") && op == "create-bucket" {
            return match failure.code.as_deref() {
                Some("BucketAlreadyOwnedByYou") => Some("bucket already owned"),
                _ => None,
            };
        }
        // Lambda create-function falls through to the update split.
        if service == "lambda" && op == "create-function" {
            return None;
        }
        return Some("resource already exists");
    }

    // Duplicate security-group rules are reported as a distinct code.
    if service == "ec2"
        && op.starts_with("authorize-security-group")
        && failure.code.as_deref() == Some("InvalidPermission.Duplicate")
    {
        return Some("rule already present");
    }

    // A conflicting subnet CIDR on create means the subnet is already carved.
    if service == "ec2"
        && op == "create-subnet"
        && failure.code.as_deref() == Some("InvalidSubnet.Conflict")
    {
        return Some("subnet range already allocated");
    }

    None
}
