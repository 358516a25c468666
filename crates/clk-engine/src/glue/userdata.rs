//! EC2 user-data synthesis: replace placeholder or threadbare bootstrap
//! scripts with one that installs Docker, logs in to ECR, pulls the expected
//! image, and runs it bound to the app port with environment from bindings.

use crate::argops::{flag_value, set_flag_value};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use clk_core::BindingMap;
use std::sync::OnceLock;

const DEFAULT_PORT: &str = "8080";
const DEFAULT_IMAGE: &str = "nginx:latest";

/// Whether the current `--user-data` value needs replacing: a placeholder, a
/// trivial script, or a script with no container start.
pub fn needs_rewrite(args: &[String]) -> bool {
    let Some(value) = flag_value(args, "--user-data") else {
        return false;
    };
    let decoded = decode_if_base64(value);
    is_placeholder(&decoded) || is_trivial(&decoded) || !decoded.contains("docker run")
}

fn is_placeholder(script: &str) -> bool {
    let trimmed = script.trim();
    trimmed.is_empty()
        || (trimmed.contains('<') && trimmed.contains('>'))
        || trimmed.contains("REPLACE_ME")
        || trimmed.contains("TODO")
}

fn is_trivial(script: &str) -> bool {
    script
        .lines()
        .filter(|l| {
            let t = l.trim();
            !t.is_empty() && !t.starts_with('#')
        })
        .count()
        < 3
}

fn decode_if_base64(value: &str) -> String {
    if value.starts_with("#!") || value.contains(' ') {
        return value.to_string();
    }
    BASE64
        .decode(value)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| value.to_string())
}

/// Rewrite `--user-data` with the synthesized bootstrap, base64-encoded.
pub fn rewrite(args: &mut Vec<String>, bindings: &BindingMap, question: &str, region: &str) {
    let script = synthesize(bindings, question, region);
    set_flag_value(args, "--user-data", &BASE64.encode(script));
}

/// The image to run: ECR repository binding first, then an explicit IMAGE
/// binding, then an image-looking token in the user's request, then nginx.
pub fn image_source(bindings: &BindingMap, question: &str) -> String {
    if let Some(uri) = bindings.get("ECR_URI") {
        return if uri.rsplit('/').next().map(|p| p.contains(':')).unwrap_or(false) {
            uri.to_string()
        } else {
            format!("{uri}:latest")
        };
    }
    if let Some(image) = bindings.get("IMAGE") {
        return image.to_string();
    }
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(
            r"\b([a-z0-9][a-z0-9._-]*(?:/[a-z0-9][a-z0-9._-]*)+(?::[a-zA-Z0-9._-]+)?)\b",
        )
        .expect("static regex")
    });
    if let Some(caps) = re.captures(question) {
        return caps[1].to_string();
    }
    DEFAULT_IMAGE.to_string()
}

/// Build the bootstrap script from current bindings.
pub fn synthesize(bindings: &BindingMap, question: &str, region: &str) -> String {
    let image = image_source(bindings, question);
    let port = bindings.get("APP_PORT").unwrap_or(DEFAULT_PORT);

    let env_flags: String = bindings
        .iter()
        .filter_map(|(k, v)| {
            k.strip_prefix("ENV_")
                .filter(|_| !v.is_empty())
                .map(|name| format!("-e {name}={v} "))
        })
        .collect();

    let ecr_login = if image.contains(".ecr.") {
        let registry = image.split('/').next().unwrap_or_default();
        let ecr_region = image
            .split(".ecr.")
            .nth(1)
            .and_then(|rest| rest.split('.').next())
            .unwrap_or(region);
        format!(
            r#"for i in 1 2 3 4 5; do
  aws ecr get-login-password --region {ecr_region} | docker login --username AWS --password-stdin {registry} && break
  sleep 10
done
"#
        )
    } else {
        String::new()
    };

    format!(
        r#"#!/bin/bash
set -x
if ! command -v docker >/dev/null 2>&1; then
  yum install -y docker || dnf install -y docker || (apt-get update -y && apt-get install -y docker.io)
fi
systemctl enable --now docker || service docker start || true
{ecr_login}for i in 1 2 3 4 5; do
  docker pull {image} && break
  sleep 10
done
docker rm -f app 2>/dev/null || true
docker run -d --name app --restart unless-stopped -p {port}:{port} {env_flags}{image}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn placeholder_and_trivial_scripts_need_rewrite() {
        let placeholder = argv(&["ec2", "run-instances", "--user-data", "<USER_DATA>"]);
        assert!(needs_rewrite(&placeholder));

        let trivial = argv(&["ec2", "run-instances", "--user-data", "#!/bin/bash\necho hi"]);
        assert!(needs_rewrite(&trivial));

        let no_docker = argv(&[
            "ec2", "run-instances", "--user-data",
            "#!/bin/bash\nyum install -y httpd\nsystemctl start httpd\necho done\necho more",
        ]);
        assert!(needs_rewrite(&no_docker));
    }

    #[test]
    fn complete_script_is_left_alone() {
        let script = "#!/bin/bash\nyum install -y docker\nsystemctl start docker\ndocker pull app\ndocker run -d -p 80:80 app";
        let args = argv(&["ec2", "run-instances", "--user-data", script]);
        assert!(!needs_rewrite(&args));
    }

    #[test]
    fn absent_user_data_is_not_rewritten() {
        assert!(!needs_rewrite(&argv(&["ec2", "run-instances", "--image-id", "ami-1"])));
    }

    #[test]
    fn base64_user_data_is_decoded_before_judging() {
        let full = "#!/bin/bash\nyum install -y docker\nsystemctl start docker\ndocker run -d app";
        let encoded = BASE64.encode(full);
        let args = argv(&["ec2", "run-instances", "--user-data", &encoded]);
        assert!(!needs_rewrite(&args));
    }

    #[test]
    fn image_prefers_ecr_binding() {
        let mut bindings = BindingMap::new();
        bindings.set("ECR_URI", "123456789012.dkr.ecr.us-east-1.amazonaws.com/app");
        assert_eq!(
            image_source(&bindings, ""),
            "123456789012.dkr.ecr.us-east-1.amazonaws.com/app:latest"
        );
    }

    #[test]
    fn image_from_question_when_no_bindings() {
        let bindings = BindingMap::new();
        assert_eq!(
            image_source(&bindings, "deploy ghcr.io/acme/web:v2 behind an ALB"),
            "ghcr.io/acme/web:v2"
        );
        assert_eq!(image_source(&bindings, "deploy a web app"), DEFAULT_IMAGE);
    }

    #[test]
    fn synthesized_script_wires_port_env_and_login() {
        let mut bindings = BindingMap::new();
        bindings.set("ECR_URI", "123456789012.dkr.ecr.eu-west-1.amazonaws.com/app");
        bindings.set("APP_PORT", "3000");
        bindings.set("ENV_DATABASE_URL", "postgres://db/app");
        let script = synthesize(&bindings, "", "us-east-1");
        assert!(script.contains("-p 3000:3000"));
        assert!(script.contains("-e DATABASE_URL=postgres://db/app"));
        assert!(script.contains("--password-stdin 123456789012.dkr.ecr.eu-west-1.amazonaws.com"));
        assert!(script.contains("--region eu-west-1"));
        assert!(script.contains("docker run -d"));
    }

    #[test]
    fn rewrite_base64_encodes() {
        let mut args = argv(&["ec2", "run-instances", "--user-data", "<USER_DATA>"]);
        let bindings = BindingMap::new();
        rewrite(&mut args, &bindings, "", "us-east-1");
        let value = flag_value(&args, "--user-data").unwrap();
        let decoded = String::from_utf8(BASE64.decode(value).unwrap()).unwrap();
        assert!(decoded.starts_with("#!/bin/bash"));
        assert!(decoded.contains("docker run"));
    }
}
