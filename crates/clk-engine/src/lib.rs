//! Apply-time execution engine.
//!
//! Takes a reviewed plan and drives it to completion: placeholder binding,
//! CLI dispatch, failure classification, layered self-healing (transient
//! retry, deterministic glue, remediation, agentic fix), durable
//! checkpointing, and post-deploy verification.
//!
//! The engine is single-threaded over the command list; the only intra-run
//! parallelism is the bounded post-deploy diagnostic fan-out.

pub mod actuator;
pub mod agentic;
pub mod argops;
pub mod executor;
pub mod frontdoor;
pub mod glue;
pub mod ignore;
pub mod infer;
pub mod learn;
pub mod postdeploy;
pub mod remediate;
pub mod subst;
pub mod validate;
pub mod waiters;

pub use actuator::{Actuator, CliRequest, ProcessActuator};
pub use executor::{execute_plan, execute_plan_with};

use clk_ai::Oracle;
use clk_core::{HealPolicy, Provider};
use clk_process::SharedWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Every interval and deadline the engine sleeps on, in one place. Defaults
/// are the production values; tests swap in [`Timings::fast`].
#[derive(Debug, Clone)]
pub struct Timings {
    /// Base for transient-retry backoff (0.3 × 2ⁿ).
    pub transient_base: Duration,
    /// Base for LLM phase backoff (1s, 2s, 4s).
    pub llm_backoff_base: Duration,
    pub cfn_poll: Duration,
    pub cfn_deadline: Duration,
    pub health_poll: Duration,
    pub initial_health_deadline: Duration,
    pub final_health_deadline: Duration,
    pub ssm_poll: Duration,
    pub ssm_deadline: Duration,
    /// IAM detach convergence wait bound.
    pub iam_converge: Duration,
    /// Linear backoff base for delete-role retries (0.6 × k).
    pub iam_delete_base: Duration,
    pub frontdoor_poll: Duration,
    pub frontdoor_deadline: Duration,
    pub swarm_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            transient_base: Duration::from_millis(300),
            llm_backoff_base: Duration::from_secs(1),
            cfn_poll: Duration::from_secs(15),
            cfn_deadline: Duration::from_secs(60 * 60),
            health_poll: Duration::from_secs(15),
            initial_health_deadline: Duration::from_secs(2 * 60),
            final_health_deadline: Duration::from_secs(5 * 60),
            ssm_poll: Duration::from_secs(5),
            ssm_deadline: Duration::from_secs(5 * 60),
            iam_converge: Duration::from_secs(10),
            iam_delete_base: Duration::from_millis(600),
            frontdoor_poll: Duration::from_secs(15),
            frontdoor_deadline: Duration::from_secs(20 * 60),
            swarm_timeout: Duration::from_secs(25),
        }
    }
}

impl Timings {
    /// Millisecond-scale timings for tests.
    pub fn fast() -> Self {
        let ms = Duration::from_millis(1);
        Self {
            transient_base: ms,
            llm_backoff_base: ms,
            cfn_poll: ms,
            cfn_deadline: Duration::from_millis(250),
            health_poll: ms,
            initial_health_deadline: Duration::from_millis(50),
            final_health_deadline: Duration::from_millis(100),
            ssm_poll: ms,
            ssm_deadline: Duration::from_millis(250),
            iam_converge: Duration::from_millis(10),
            iam_delete_base: ms,
            frontdoor_poll: ms,
            frontdoor_deadline: Duration::from_millis(250),
            swarm_timeout: Duration::from_millis(250),
        }
    }
}

/// Caller-facing options for one apply run.
pub struct ExecuteOptions {
    pub profile: String,
    pub region: String,
    /// Live progress sink; CLI output streams here.
    pub writer: SharedWriter,
    /// Unlocks destructive verbs in validation and glue.
    pub destroyer: bool,
    /// LLM capability for the inference/remediation/agentic tiers. `None`
    /// disables those tiers; everything deterministic still runs.
    pub oracle: Option<Arc<dyn Oracle>>,
    pub debug: bool,
    /// Explicit checkpoint key; defaults to the plan fingerprint.
    pub checkpoint_key: Option<String>,
    pub disable_durable_checkpoint: bool,
    /// Restart unhealthy containers even without loopback evidence.
    pub aggressive_autofix: bool,
    pub heal_policy: HealPolicy,
    pub cancel: CancellationToken,
    pub timings: Timings,
    /// Checkpoint directory override; `None` means `~/.clanker/checkpoints`.
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            profile: "default".to_string(),
            region: "us-east-1".to_string(),
            writer: clk_process::null_writer(),
            destroyer: false,
            oracle: None,
            debug: false,
            checkpoint_key: None,
            disable_durable_checkpoint: false,
            aggressive_autofix: false,
            heal_policy: HealPolicy::default(),
            cancel: CancellationToken::new(),
            timings: Timings::default(),
            checkpoint_dir: None,
        }
    }
}

/// Shared per-run context handed to every component.
pub struct Ctx {
    pub actuator: Arc<dyn Actuator>,
    pub oracle: Option<Arc<dyn Oracle>>,
    pub writer: SharedWriter,
    pub cancel: CancellationToken,
    pub provider: Provider,
    pub profile: String,
    pub region: String,
    pub destroyer: bool,
    pub aggressive_autofix: bool,
    pub debug: bool,
    pub question: String,
    pub timings: Timings,
}

impl Ctx {
    /// One line of live progress.
    pub fn say(&self, msg: impl AsRef<str>) {
        clk_process::emit(&self.writer, msg.as_ref());
    }

    /// Run a command through the run's provider.
    pub async fn run_cli(&self, args: Vec<String>) -> anyhow::Result<clk_process::CliOutput> {
        self.actuator
            .run(&CliRequest {
                provider: self.provider,
                args,
                stdin: None,
            })
            .await
    }

    /// Run an AWS command built from static parts.
    pub async fn run_aws(&self, args: &[&str]) -> anyhow::Result<clk_process::CliOutput> {
        self.actuator
            .run(&CliRequest {
                provider: Provider::Aws,
                args: args.iter().map(|s| s.to_string()).collect(),
                stdin: None,
            })
            .await
    }

    /// Run an AWS command and parse its JSON output. `None` when the command
    /// failed or the output was not JSON.
    pub async fn run_aws_json(&self, args: &[&str]) -> anyhow::Result<Option<serde_json::Value>> {
        let out = self.run_aws(args).await?;
        if !out.success() {
            return Ok(None);
        }
        Ok(learn::parse_json_lenient(&out.merged))
    }
}
