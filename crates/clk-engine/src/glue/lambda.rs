//! Lambda glue: in-memory deployment-package synthesis and the
//! create→update split for functions that already exist.

use crate::argops::{flag_value, has_flag};
use crate::glue::GlueOutcome;
use crate::Ctx;
use anyhow::{Context as _, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use std::io::Write;

/// Placeholder handler body used when the plan asks for an inline zip.
const HANDLER_SOURCE: &str = r#"import json

def handler(event, context):
    return {
        "statusCode": 200,
        "headers": {"Content-Type": "application/json"},
        "body": json.dumps({"ok": True}),
    }
"#;

/// Build a minimal deployment package in memory and return it base64-encoded.
pub fn inline_zip_base64() -> Result<String> {
    let cursor = std::io::Cursor::new(Vec::new());
    let mut writer = zip::ZipWriter::new(cursor);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);
    writer
        .start_file("lambda_function.py", options)
        .context("zip entry")?;
    writer.write_all(HANDLER_SOURCE.as_bytes())?;
    let cursor = writer.finish().context("zip finish")?;
    Ok(BASE64.encode(cursor.into_inner()))
}

/// Whether `create-function` args reference a zip the engine must synthesize:
/// `--zip-file fileb://-`, or a `fileb://` path that does not exist.
pub fn needs_inline_zip(args: &[String]) -> bool {
    let Some(value) = flag_value(args, "--zip-file") else {
        return false;
    };
    match value.strip_prefix("fileb://") {
        Some("-") => true,
        Some(path) => !std::path::Path::new(path).exists(),
        None => false,
    }
}

/// Rewrite `lambda create-function --zip-file fileb://-` into
/// `--cli-input-json` carrying the synthesized package as a base64 `ZipFile`.
pub fn rewrite_with_inline_zip(args: &[String]) -> Result<Vec<String>> {
    let zip_b64 = inline_zip_base64()?;
    let mut input = serde_json::Map::new();
    if let Some(name) = flag_value(args, "--function-name") {
        input.insert("FunctionName".to_string(), json!(name));
    }
    input.insert(
        "Runtime".to_string(),
        json!(flag_value(args, "--runtime").unwrap_or("python3.12")),
    );
    if let Some(role) = flag_value(args, "--role") {
        input.insert("Role".to_string(), json!(role));
    }
    input.insert(
        "Handler".to_string(),
        json!(flag_value(args, "--handler").unwrap_or("lambda_function.handler")),
    );
    if let Some(timeout) = flag_value(args, "--timeout").and_then(|t| t.parse::<u64>().ok()) {
        input.insert("Timeout".to_string(), json!(timeout));
    }
    if let Some(memory) = flag_value(args, "--memory-size").and_then(|m| m.parse::<u64>().ok()) {
        input.insert("MemorySize".to_string(), json!(memory));
    }
    input.insert("Code".to_string(), json!({ "ZipFile": zip_b64 }));

    Ok(vec![
        "lambda".to_string(),
        "create-function".to_string(),
        "--cli-input-json".to_string(),
        Value::Object(input).to_string(),
    ])
}

/// `create-function` on an existing function: run `update-function-code` and
/// `update-function-configuration` instead.
pub async fn create_to_update(ctx: &Ctx, args: &[String]) -> Result<GlueOutcome> {
    let (function_name, code_args, config_args) = if has_flag(args, "--cli-input-json") {
        let Some(input) = flag_value(args, "--cli-input-json")
            .and_then(|j| serde_json::from_str::<Value>(j).ok())
        else {
            return Ok(GlueOutcome::NotApplicable);
        };
        let Some(name) = input.get("FunctionName").and_then(Value::as_str).map(String::from)
        else {
            return Ok(GlueOutcome::NotApplicable);
        };

        let mut code_input = serde_json::Map::new();
        code_input.insert("FunctionName".to_string(), json!(name));
        if let Some(zip) = input
            .get("Code")
            .and_then(|c| c.get("ZipFile"))
            .and_then(Value::as_str)
        {
            code_input.insert("ZipFile".to_string(), json!(zip));
        }
        let code_input = Value::Object(code_input);
        let mut config_input = serde_json::Map::new();
        config_input.insert("FunctionName".to_string(), json!(name));
        for key in ["Runtime", "Role", "Handler", "Timeout", "MemorySize", "Environment"] {
            if let Some(value) = input.get(key) {
                config_input.insert(key.to_string(), value.clone());
            }
        }
        (
            name,
            vec![
                "lambda".to_string(),
                "update-function-code".to_string(),
                "--cli-input-json".to_string(),
                code_input.to_string(),
            ],
            vec![
                "lambda".to_string(),
                "update-function-configuration".to_string(),
                "--cli-input-json".to_string(),
                Value::Object(config_input).to_string(),
            ],
        )
    } else {
        let Some(name) = flag_value(args, "--function-name").map(String::from) else {
            return Ok(GlueOutcome::NotApplicable);
        };
        let mut code_args = vec![
            "lambda".to_string(),
            "update-function-code".to_string(),
            "--function-name".to_string(),
            name.clone(),
        ];
        if let Some(zip) = flag_value(args, "--zip-file") {
            code_args.push("--zip-file".to_string());
            code_args.push(zip.to_string());
        } else if let Some(image) = flag_value(args, "--image-uri") {
            code_args.push("--image-uri".to_string());
            code_args.push(image.to_string());
        }

        let mut config_args = vec![
            "lambda".to_string(),
            "update-function-configuration".to_string(),
            "--function-name".to_string(),
            name.clone(),
        ];
        for flag in ["--runtime", "--role", "--handler", "--timeout", "--memory-size", "--environment"] {
            if let Some(value) = flag_value(args, flag) {
                config_args.push(flag.to_string());
                config_args.push(value.to_string());
            }
        }
        (name, code_args, config_args)
    };

    ctx.say(&format!(
        "function {function_name} exists; updating code and configuration instead"
    ));

    let code_out = ctx.run_cli(code_args).await?;
    if !code_out.success() {
        return Ok(GlueOutcome::NotApplicable);
    }
    let config_out = ctx.run_cli(config_args).await?;
    if !config_out.success() {
        return Ok(GlueOutcome::NotApplicable);
    }
    Ok(GlueOutcome::Resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn inline_zip_is_valid_base64_of_a_zip() {
        let b64 = inline_zip_base64().unwrap();
        let bytes = BASE64.decode(&b64).unwrap();
        // zip local-file-header magic
        assert_eq!(&bytes[..4], b"PK\x03\x04");
    }

    #[test]
    fn detects_stdin_zip_reference() {
        assert!(needs_inline_zip(&argv(&[
            "lambda", "create-function", "--zip-file", "fileb://-"
        ])));
        assert!(needs_inline_zip(&argv(&[
            "lambda", "create-function", "--zip-file", "fileb:///no/such/file.zip"
        ])));
        assert!(!needs_inline_zip(&argv(&["lambda", "create-function", "--image-uri", "x"])));
    }

    #[test]
    fn rewrite_builds_cli_input_json() {
        let args = argv(&[
            "lambda", "create-function",
            "--function-name", "hello",
            "--runtime", "python3.12",
            "--role", "arn:aws:iam::123456789012:role/lambda",
            "--handler", "lambda_function.handler",
            "--zip-file", "fileb://-",
        ]);
        let rewritten = rewrite_with_inline_zip(&args).unwrap();
        assert_eq!(rewritten[0], "lambda");
        assert_eq!(rewritten[1], "create-function");
        assert_eq!(rewritten[2], "--cli-input-json");
        let input: Value = serde_json::from_str(&rewritten[3]).unwrap();
        assert_eq!(input["FunctionName"], "hello");
        assert_eq!(input["Runtime"], "python3.12");
        assert!(input["Code"]["ZipFile"].as_str().unwrap().len() > 100);
        // no stray zip flag remains
        assert!(!rewritten.iter().any(|a| a == "--zip-file"));
    }
}
