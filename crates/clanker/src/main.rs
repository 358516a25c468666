use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod cli;

use clk_core::Plan;
use cli::{load_plan, make_oracle, stdout_writer};
use std::collections::BTreeMap;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Parser)]
#[command(name = "clanker", about = "Apply reviewed cloud plans with self-healing execution")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a plan file (use '-' to read from stdin).
    Apply {
        /// Path to the plan JSON.
        plan: String,
        #[arg(long, default_value = "default")]
        profile: String,
        #[arg(long, default_value = "us-east-1")]
        region: String,
        /// Unlock destructive operations (delete/terminate/...).
        #[arg(long)]
        destroy: bool,
        /// Explicit checkpoint key (default: plan fingerprint).
        #[arg(long)]
        checkpoint_key: Option<String>,
        /// Run without the durable checkpoint.
        #[arg(long)]
        no_checkpoint: bool,
        /// Restart unhealthy containers even without loopback evidence.
        #[arg(long)]
        aggressive: bool,
        /// AI provider for the healing tiers (anthropic|openai).
        #[arg(long)]
        ai_provider: Option<String>,
        /// Model override for the AI provider.
        #[arg(long)]
        ai_model: Option<String>,
        #[arg(long)]
        debug: bool,
    },
    /// Parse and print a plan in normalized form.
    Plan {
        /// Path to the plan JSON (use '-' for stdin).
        plan: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Plan { plan } => {
            let plan = load_plan(&plan)?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
        Commands::Apply {
            plan,
            profile,
            region,
            destroy,
            checkpoint_key,
            no_checkpoint,
            aggressive,
            ai_provider,
            ai_model,
            debug,
        } => {
            let plan: Plan = load_plan(&plan)?;
            let cancel = CancellationToken::new();
            spawn_ctrl_c_handler(cancel.clone());

            let oracle = match ai_provider {
                Some(name) => {
                    let provider = clk_ai::AiProvider::from_str(&name)?;
                    Some(make_oracle(provider, ai_model.as_deref())?)
                }
                None => None,
            };

            let opts = clk_engine::ExecuteOptions {
                profile,
                region,
                writer: stdout_writer(),
                destroyer: destroy,
                oracle,
                debug,
                checkpoint_key,
                disable_durable_checkpoint: no_checkpoint,
                aggressive_autofix: aggressive,
                cancel,
                ..clk_engine::ExecuteOptions::default()
            };

            let mut bindings = BTreeMap::new();
            clk_engine::execute_plan(&plan, opts, Some(&mut bindings))
                .await
                .context("plan execution failed")?;

            if !bindings.is_empty() {
                println!("\nlearned bindings:");
                for (key, value) in &bindings {
                    println!("  {key} = {value}");
                }
            }
            Ok(())
        }
    }
}

fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("ctrl-c received; cancelling run");
            cancel.cancel();
        }
    });
}
