//! Command validation: the last gate before anything is handed to a CLI.
//!
//! Rejects commands that are not provider-CLI invocations, tokens that are
//! shell operators, and destructive verbs unless the run is in destroyer
//! mode. The same gate validates commands proposed by the LLM tiers.

/// Binaries and interpreters a plan must never name. The plan speaks
/// provider-CLI; anything else is an attempt to run arbitrary software.
const DENY_FIRST_TOKENS: &[&str] = &[
    "node", "npm", "npx", "bash", "sh", "zsh", "fish", "curl", "wget", "zip", "unzip",
    "terraform", "tofu", "make", "docker", "kubectl", "git", "ssh", "scp", "perl", "ruby", "go",
];

const SHELL_OPERATORS: &[&str] = &[";", "|", "||", "&&", "<", ">", ">>", "<<"];

const DESTRUCTIVE_PREFIXES: &[&str] = &["delete", "terminate", "remove", "destroy"];

/// Validate a token vector. `Ok(())` or the rejection reason.
pub fn check(args: &[String], destroyer: bool) -> Result<(), String> {
    let Some(first) = args.first() else {
        return Err("empty command".to_string());
    };

    let lowered = first.to_ascii_lowercase();
    if lowered.starts_with("python") {
        return Err(format!("'{first}' is not a provider CLI service"));
    }
    if DENY_FIRST_TOKENS.contains(&lowered.as_str()) {
        return Err(format!("'{first}' is not a provider CLI service"));
    }
    if first.contains('/') || first.contains('\\') || first.contains('.') || first.starts_with('-')
    {
        return Err(format!("'{first}' does not look like a service name"));
    }

    // Shell operators must appear as whole tokens to be dangerous here; the
    // args are passed to exec without a shell, so characters inside values
    // (JMESPath queries, descriptions) are fine. User-data payloads are
    // whitelisted entirely: bootstrap scripts are full of shell.
    let mut skip_next = false;
    for token in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if token == "--user-data" {
            skip_next = true;
            continue;
        }
        if SHELL_OPERATORS.contains(&token.as_str()) {
            return Err(format!("shell operator token '{token}' is not allowed"));
        }
    }

    if let Some(op) = args.get(1) {
        let op_lowered = op.to_ascii_lowercase();
        if !destroyer
            && DESTRUCTIVE_PREFIXES
                .iter()
                .any(|p| op_lowered.starts_with(p))
        {
            return Err(format!(
                "destructive operation '{op}' requires destroy mode"
            ));
        }
    }

    Ok(())
}
