//! Argument vector construction for AWS dispatch: flag injection, region
//! selection, and secret redaction for the command echo.

use std::sync::OnceLock;

/// Flags the dispatcher owns. Any copies found in the input are stripped so
/// that exactly one of each is appended.
const INJECTED_FLAGS: &[&str] = &["--profile", "--region", "--no-cli-pager"];

/// Build the final argv for an AWS invocation: the plan args with dispatcher
/// flags stripped, then exactly one `--profile`, `--region`, `--no-cli-pager`.
pub fn build_argv(args: &[String], profile: &str, region: &str) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len() + 5);
    let mut skip_value = false;
    for arg in args {
        if skip_value {
            skip_value = false;
            continue;
        }
        if INJECTED_FLAGS.contains(&arg.as_str()) {
            skip_value = arg != "--no-cli-pager";
            continue;
        }
        if let Some(flag) = arg.split('=').next() {
            if arg.contains('=') && INJECTED_FLAGS.contains(&flag) {
                continue;
            }
        }
        out.push(arg.clone());
    }
    out.push("--profile".to_string());
    out.push(profile.to_string());
    out.push("--region".to_string());
    out.push(region.to_string());
    out.push("--no-cli-pager".to_string());
    out
}

fn region_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[a-z]{2,4}(-[a-z]+)+-\d$").expect("static regex"))
}

/// Pick the region for a command. Precedence: an explicit `--region` in the
/// args, then a region embedded in any ARN token, then the default. The
/// second element is a notice when the ARN-derived region differs from the
/// default.
pub fn region_for(args: &[String], default_region: &str) -> (String, Option<String>) {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--region" {
            if let Some(value) = iter.next() {
                return (value.clone(), None);
            }
        }
        if let Some(value) = arg.strip_prefix("--region=") {
            return (value.to_string(), None);
        }
    }

    for arg in args {
        for token in arg.split(|c: char| c.is_whitespace() || c == ',' || c == '"') {
            if let Some(region) = arn_region(token) {
                if region != default_region {
                    let notice = format!(
                        "using region {region} from ARN {token} (default is {default_region})"
                    );
                    return (region, Some(notice));
                }
                return (region, None);
            }
        }
    }

    (default_region.to_string(), None)
}

/// Region field of an ARN token, when present and plausible.
fn arn_region(token: &str) -> Option<String> {
    if !token.starts_with("arn:") {
        return None;
    }
    let region = token.split(':').nth(3)?;
    if region_re().is_match(region) {
        Some(region.to_string())
    } else {
        None
    }
}

/// Render args for logging with secrets replaced by `<redacted>`: any
/// `--user-data` value, and any `--value` when `--type SecureString` is also
/// present.
pub fn redacted_display(args: &[String]) -> String {
    let secure_string = args
        .windows(2)
        .any(|w| w[0] == "--type" && w[1] == "SecureString");
    let mut out = Vec::with_capacity(args.len());
    let mut redact_next = false;
    for arg in args {
        if redact_next {
            out.push("<redacted>".to_string());
            redact_next = false;
            continue;
        }
        if arg == "--user-data" || (secure_string && arg == "--value") {
            redact_next = true;
            out.push(arg.clone());
            continue;
        }
        if arg.starts_with("--user-data=") {
            out.push("--user-data=<redacted>".to_string());
            continue;
        }
        out.push(arg.clone());
    }
    out.join(" ")
}
