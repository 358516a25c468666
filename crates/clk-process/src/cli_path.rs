//! Provider CLI binary resolution.
//!
//! Order: explicit environment override, then PATH, then a platform list of
//! well-known install locations. Only the AWS binary has an override variable.

use anyhow::{Result, bail};
use std::path::PathBuf;

/// Explicit override for the AWS CLI binary path.
pub const AWS_CLI_PATH_ENV: &str = "CLANKER_AWS_CLI_PATH";

#[cfg(unix)]
const AWS_WELL_KNOWN: &[&str] = &[
    "/usr/local/bin/aws",
    "/usr/bin/aws",
    "/opt/homebrew/bin/aws",
    "/usr/local/aws-cli/v2/current/bin/aws",
];

#[cfg(windows)]
const AWS_WELL_KNOWN: &[&str] = &[
    r"C:\Program Files\Amazon\AWSCLIV2\aws.exe",
    r"C:\Program Files (x86)\Amazon\AWSCLIV2\aws.exe",
];

/// Directories worth appending to a child's PATH so nested `aws` calls inside
/// generated scripts resolve even under a minimal parent environment.
pub fn well_known_dirs(binary: &str) -> Vec<PathBuf> {
    if binary != "aws" {
        return Vec::new();
    }
    AWS_WELL_KNOWN
        .iter()
        .filter_map(|p| PathBuf::from(p).parent().map(|d| d.to_path_buf()))
        .collect()
}

/// Resolve the CLI binary for `binary` (e.g. `aws`, `gcloud`, `az`,
/// `wrangler`, `cloudflared`, `curl`).
pub fn resolve_binary(binary: &str) -> Result<PathBuf> {
    if binary == "aws" {
        if let Ok(explicit) = std::env::var(AWS_CLI_PATH_ENV) {
            let path = PathBuf::from(&explicit);
            if path.is_file() {
                return Ok(path);
            }
            bail!("{AWS_CLI_PATH_ENV} points at '{explicit}', which does not exist");
        }
    }

    if let Ok(found) = which::which(binary) {
        return Ok(found);
    }

    if binary == "aws" {
        for candidate in AWS_WELL_KNOWN {
            let path = PathBuf::from(candidate);
            if path.is_file() {
                return Ok(path);
            }
        }
    }

    bail!(
        "'{binary}' CLI not found on PATH{}",
        if binary == "aws" {
            format!(" (set {AWS_CLI_PATH_ENV} to point at the binary)")
        } else {
            String::new()
        }
    )
}
