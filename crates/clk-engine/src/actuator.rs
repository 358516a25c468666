//! The actuator seam: everything the engine asks of the outside world goes
//! through [`Actuator`], so tests drive the whole state machine against a
//! scripted fake while production runs real CLI subprocesses.

use anyhow::Result;
use clk_core::Provider;
use clk_process::{ChildConfig, CliOutput, SharedWriter, build_argv, redacted_display, region_for,
    resolve_binary};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One CLI invocation request. `args` never includes the binary name or the
/// dispatcher-owned flags.
#[derive(Debug, Clone)]
pub struct CliRequest {
    pub provider: Provider,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
}

#[async_trait::async_trait]
pub trait Actuator: Send + Sync {
    async fn run(&self, req: &CliRequest) -> Result<CliOutput>;
}

/// Production actuator: resolves the provider binary and spawns it with the
/// injected profile/region flags, streaming output to the writer.
pub struct ProcessActuator {
    profile: String,
    region: String,
    writer: SharedWriter,
    cancel: CancellationToken,
}

impl ProcessActuator {
    pub fn new(
        profile: String,
        region: String,
        writer: SharedWriter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            profile,
            region,
            writer,
            cancel,
        }
    }

    fn child_config(&self, provider: Provider, binary: &str) -> ChildConfig {
        let mut config = ChildConfig {
            extra_path: clk_process::cli_path::well_known_dirs(binary),
            ..ChildConfig::default()
        };
        if provider == Provider::Cloudflare {
            for key in ["CLOUDFLARE_API_TOKEN", "CLOUDFLARE_ACCOUNT_ID"] {
                if let Ok(value) = std::env::var(key) {
                    config.forward_env.push((key.to_string(), value));
                }
            }
        }
        config
    }
}

#[async_trait::async_trait]
impl Actuator for ProcessActuator {
    async fn run(&self, req: &CliRequest) -> Result<CliOutput> {
        let binary_name = req.provider.binary();
        let binary = resolve_binary(binary_name)?;
        let config = self.child_config(req.provider, binary_name);

        let argv = if req.provider == Provider::Aws {
            let (region, notice) = region_for(&req.args, &self.region);
            if let Some(notice) = notice {
                clk_process::emit(&self.writer, &format!("note: {notice}"));
            }
            build_argv(&req.args, &self.profile, &region)
        } else {
            req.args.clone()
        };

        clk_process::emit(
            &self.writer,
            &format!("→ {binary_name} {}", redacted_display(&req.args)),
        );
        debug!(binary = %binary.display(), args = %redacted_display(&argv), "dispatch");

        clk_process::run_streamed(
            &binary,
            &argv,
            req.stdin.clone(),
            &config,
            &self.writer,
            &self.cancel,
        )
        .await
    }
}
