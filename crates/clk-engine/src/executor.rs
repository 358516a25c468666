//! The execution loop: drives each plan command through the per-step state
//! machine and the layered healing pipeline, with checkpointing between
//! steps.
//!
//! Per command: `Prepared → Substituted → Resolved → Validated → Dispatched →
//! (Succeeded | FailureClassified)`, and on failure through the fixed
//! recovery precedence: ignore, transient retry, deterministic glue,
//! remediation, agentic fix, hard fail.

use crate::actuator::ProcessActuator;
use crate::agentic::{self, AgenticOutcome};
use crate::remediate::{self, RemediateOutcome};
use crate::waiters::{backoff_sleep, sleep_cancellable};
use crate::{Ctx, ExecuteOptions, glue, ignore, infer, learn, postdeploy, frontdoor, subst, validate};
use anyhow::Result as AnyResult;
use clk_checkpoint::{CheckpointStore, plan_fingerprint, sanitize_key};
use clk_core::{
    BindingMap, EngineError, Failure, FailureCategory, HealState, Plan, PlanCommand, Progress,
    Provider,
};
use clk_process::CliOutput;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-step lifecycle, traced for debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepState {
    Prepared,
    Substituted,
    Resolved,
    Validated,
    Dispatched,
    Succeeded,
    FailureClassified,
    Ignored,
    Retried,
    HardFail,
}

/// How a step reached its terminal state.
enum StepDone {
    Succeeded,
    Ignored,
    Skipped,
}

/// Result of one dispatch (including any post-success waiter).
pub(crate) enum DispatchResult {
    Success(CliOutput),
    Failed(Failure),
}

/// Dispatch `args`, learn from success, and run any post-success waiter. The
/// single funnel every tier retries through, so learning and async waits are
/// uniform.
pub(crate) async fn dispatch_and_wait(
    ctx: &Ctx,
    bindings: &mut BindingMap,
    cmd: &PlanCommand,
    args: &[String],
) -> AnyResult<DispatchResult> {
    let service = args.first().map(String::as_str).unwrap_or("").to_string();
    let op = args.get(1).map(String::as_str).unwrap_or("").to_string();

    let out = ctx.run_cli(args.to_vec()).await?;
    if !out.success() {
        return Ok(DispatchResult::Failed(Failure::from_output(
            &service, &op, &out.merged,
        )));
    }

    learn::learn(cmd, args, &out.merged, bindings);

    if let Some(failure) = glue::post_success(ctx, args).await? {
        return Ok(DispatchResult::Failed(failure));
    }
    Ok(DispatchResult::Success(out))
}

/// Execute a plan with the production process actuator.
pub async fn execute_plan(
    plan: &Plan,
    opts: ExecuteOptions,
    output_bindings: Option<&mut BTreeMap<String, String>>,
) -> Result<(), EngineError> {
    let actuator = Arc::new(ProcessActuator::new(
        opts.profile.clone(),
        opts.region.clone(),
        opts.writer.clone(),
        opts.cancel.clone(),
    ));
    execute_plan_with(plan, opts, actuator, output_bindings).await
}

/// Execute a plan against an explicit actuator (the test seam).
pub async fn execute_plan_with(
    plan: &Plan,
    opts: ExecuteOptions,
    actuator: Arc<dyn crate::Actuator>,
    output_bindings: Option<&mut BTreeMap<String, String>>,
) -> Result<(), EngineError> {
    let mut plan = plan.clone();
    plan.normalize();

    let ctx = Ctx {
        actuator,
        oracle: opts.oracle.clone(),
        writer: opts.writer.clone(),
        cancel: opts.cancel.clone(),
        provider: plan.provider(),
        profile: opts.profile.clone(),
        region: opts.region.clone(),
        destroyer: opts.destroyer,
        aggressive_autofix: opts.aggressive_autofix,
        debug: opts.debug,
        question: plan.question.clone(),
        timings: opts.timings.clone(),
    };

    let mut bindings = BindingMap::new();
    if let Some(seed) = output_bindings.as_deref() {
        bindings.merge_missing(seed);
    }

    let store = if opts.disable_durable_checkpoint {
        None
    } else {
        match opts
            .checkpoint_dir
            .clone()
            .map(|dir| Ok(CheckpointStore::at(dir)))
            .unwrap_or_else(CheckpointStore::default_location)
        {
            Ok(store) => Some(store),
            Err(e) => {
                warn!(error = %e, "running without a durable checkpoint");
                None
            }
        }
    };

    let checkpoint_key = opts
        .checkpoint_key
        .as_deref()
        .map(sanitize_key)
        .filter(|k| !k.is_empty())
        .unwrap_or_else(|| {
            let command_args: Vec<Vec<String>> =
                plan.commands.iter().map(|c| c.args.clone()).collect();
            plan_fingerprint(&opts.profile, &opts.region, &command_args)
        });

    if let Some(store) = &store {
        match store.load(&checkpoint_key) {
            Ok(Some(prior)) => {
                ctx.say("found a prior checkpoint; resuming learned bindings");
                bindings.merge_missing(&prior);
                // Reserved progress keys are carried verbatim, not merged.
                for key in [clk_core::bindings::LAST_SUCCESS_KEY, clk_core::bindings::LAST_FAILURE_KEY] {
                    if let Some(value) = prior.get(key) {
                        bindings.overwrite(key, value.clone());
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "checkpoint load failed; starting fresh"),
        }
    }

    let progress = Progress::load(&bindings);
    let mut engine = Engine {
        ctx,
        bindings,
        progress,
        heal: HealState::new(),
        policy: opts.heal_policy.clone(),
        store,
        checkpoint_key,
        last_region: None,
    };

    engine.run(&plan).await?;

    if let Some(out) = output_bindings {
        *out = engine.bindings.user_snapshot();
    }
    Ok(())
}

struct Engine {
    ctx: Ctx,
    bindings: BindingMap,
    progress: Progress,
    heal: HealState,
    policy: clk_core::HealPolicy,
    store: Option<CheckpointStore>,
    checkpoint_key: String,
    last_region: Option<String>,
}

impl Engine {
    async fn run(&mut self, plan: &Plan) -> Result<(), EngineError> {
        let total = plan.commands.len();
        self.ctx.say(&format!(
            "applying {total} command(s) with profile {} in {}",
            self.ctx.profile, self.ctx.region
        ));
        if self.progress.last_success > 0 {
            self.ctx.say(&format!(
                "resuming at command {} of {total}",
                self.progress.last_success + 1
            ));
        }

        for (index, cmd) in plan.commands.iter().enumerate() {
            if self.ctx.cancel.is_cancelled() {
                return Err(EngineError::Cancelled { index });
            }
            if index < self.progress.last_success {
                debug!(index, "skipping checkpointed command");
                continue;
            }
            let label = cmd.reason.clone().unwrap_or_else(|| cmd.args.join(" "));
            self.ctx.say(&format!("[{}/{total}] {label}", index + 1));
            self.run_command(index, cmd).await?;
        }

        if self.ctx.provider == Provider::Aws {
            if postdeploy::applies(&self.ctx, &self.bindings) {
                postdeploy::run(&self.ctx, &self.bindings)
                    .await
                    .map_err(|e| EngineError::PostDeploy(format!("{e:#}")))?;
            }
            if frontdoor::applies(&self.ctx, &self.bindings) {
                if let Err(e) = frontdoor::run(&self.ctx, &mut self.bindings).await {
                    // The deploy itself is serving; a missing front door is
                    // reported, not fatal.
                    self.ctx.say(&format!("warning: https front door not created: {e:#}"));
                }
            }
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.clear(&self.checkpoint_key) {
                warn!(error = %e, "failed to clear checkpoint after success");
            }
        }
        self.ctx.say("plan applied");
        Ok(())
    }

    async fn run_command(&mut self, index: usize, cmd: &PlanCommand) -> Result<(), EngineError> {
        let debug_mode = self.ctx.debug;
        let writer = self.ctx.writer.clone();
        let step = move |state: StepState| {
            debug!(index, ?state, "step");
            if debug_mode {
                clk_process::emit(&writer, &format!("  [step {index}] {state:?}"));
            }
        };
        step(StepState::Prepared);

        if cmd.service() == "local" {
            return self.run_local(index, cmd).await;
        }

        let mut args = cmd.args.clone();

        if self.ctx.provider == Provider::Aws && subst::needs_account_id(&args) {
            if let Err(e) = subst::resolve_account_tokens(&self.ctx, &mut self.bindings, &mut args).await {
                return self.hard_fail_anyhow(index, cmd, e);
            }
        }

        if let Err(e) = glue::prepare(&self.ctx, &self.bindings, &mut args) {
            return self.hard_fail_anyhow(index, cmd, e);
        }

        step(StepState::Substituted);
        let mut unresolved = subst::substitute(&mut args, &self.bindings);
        if !unresolved.is_empty() && self.ctx.oracle.is_some() {
            if let Err(e) =
                infer::resolve_unresolved(&self.ctx, &mut self.bindings, &args, &unresolved).await
            {
                warn!(error = %e, "binding inference failed");
            }
            unresolved = subst::substitute(&mut args, &self.bindings);
        }
        step(StepState::Resolved);

        if let Err(reason) = validate::check(&args, self.ctx.destroyer) {
            self.record_failure(index);
            return Err(EngineError::Rejected { index, reason });
        }
        step(StepState::Validated);

        let outcome = if unresolved.is_empty() {
            step(StepState::Dispatched);
            self.warn_region_zigzag(&args);
            match dispatch_and_wait(&self.ctx, &mut self.bindings, cmd, &args).await {
                Ok(DispatchResult::Success(_)) => Ok(StepDone::Succeeded),
                Ok(DispatchResult::Failed(failure)) => {
                    debug!(index, state = ?StepState::FailureClassified, category = %failure.category, "step");
                    self.handle_failure(index, cmd, args, failure).await
                }
                Err(e) => return self.hard_fail_anyhow(index, cmd, e),
            }
        } else {
            // Preflight failure: unresolved placeholders reach the healing
            // pipeline, where the agentic tier may still bind them.
            let failure = Failure::synthetic(
                cmd.service(),
                cmd.op(),
                format!("unresolved placeholders: {unresolved:?}"),
            );
            self.handle_failure(index, cmd, args, failure).await
        };

        match outcome {
            Ok(done) => {
                let final_state = match &done {
                    StepDone::Succeeded => StepState::Succeeded,
                    StepDone::Ignored => StepState::Ignored,
                    StepDone::Skipped => StepState::Succeeded,
                };
                debug!(index, state = ?final_state, "step");
                self.mark_success(index);
                Ok(())
            }
            Err(e) => {
                debug!(index, state = ?StepState::HardFail, "step");
                self.record_failure(index);
                Err(e)
            }
        }
    }

    /// `local sleep <secs>`: executed in-process, clamped to 0–600s, counts
    /// as an immediate success.
    async fn run_local(&mut self, index: usize, cmd: &PlanCommand) -> Result<(), EngineError> {
        if cmd.op() == "sleep" {
            let secs: u64 = cmd
                .args
                .get(2)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0)
                .min(600);
            self.ctx.say(&format!("sleeping {secs}s"));
            if !sleep_cancellable(&self.ctx.cancel, Duration::from_secs(secs)).await {
                return Err(EngineError::Cancelled { index });
            }
        } else {
            self.ctx.say(&format!("skipping unknown local op '{}'", cmd.op()));
        }
        self.mark_success(index);
        Ok(())
    }

    /// The layered healing pipeline. Tiers only ever advance; a failure that
    /// survives a tier falls to the next.
    async fn handle_failure(
        &mut self,
        index: usize,
        cmd: &PlanCommand,
        mut args: Vec<String>,
        mut failure: Failure,
    ) -> Result<StepDone, EngineError> {
        #[derive(PartialEq)]
        enum Tier {
            Transient,
            Glue,
            Remediate,
            Agentic,
            Exhausted,
        }
        let mut tier = Tier::Transient;
        let mut transient_used = 0u32;

        loop {
            if self.ctx.cancel.is_cancelled() {
                return Err(EngineError::Cancelled { index });
            }

            if let Some(reason) = ignore::should_ignore(&failure, &args) {
                self.ctx
                    .say(&format!("treating failure as no-op: {reason}"));
                return Ok(StepDone::Ignored);
            }

            match tier {
                Tier::Transient => {
                    let transient = matches!(
                        failure.category,
                        FailureCategory::Throttled | FailureCategory::Conflict
                    );
                    if transient && transient_used < self.policy.transient_retries {
                        self.consume_budget(index)?;
                        transient_used += 1;
                        self.ctx.say(&format!(
                            "transient failure ({}); retry {transient_used}",
                            failure.code_or_category()
                        ));
                        if !backoff_sleep(
                            &self.ctx.cancel,
                            self.ctx.timings.transient_base,
                            transient_used - 1,
                        )
                        .await
                        {
                            return Err(EngineError::Cancelled { index });
                        }
                        match self.retry(index, cmd, &args).await? {
                            DispatchResult::Success(_) => return Ok(StepDone::Succeeded),
                            DispatchResult::Failed(f) => failure = f,
                        }
                    } else {
                        tier = Tier::Glue;
                    }
                }

                Tier::Glue => {
                    tier = Tier::Remediate;
                    if !glue_matches(&failure) {
                        continue;
                    }
                    self.consume_budget(index)?;
                    let outcome =
                        match glue::apply(&self.ctx, &mut self.bindings, &failure, &args).await {
                            Ok(outcome) => outcome,
                            Err(e) => return Err(self.anyhow_err(index, e)),
                        };
                    match outcome {
                        glue::GlueOutcome::NotApplicable => {}
                        glue::GlueOutcome::Resolved => return Ok(StepDone::Succeeded),
                        glue::GlueOutcome::Rewritten(new_args) => {
                            debug!(index, state = ?StepState::Retried, "step");
                            args = new_args;
                            match self.retry(index, cmd, &args).await? {
                                DispatchResult::Success(_) => return Ok(StepDone::Succeeded),
                                DispatchResult::Failed(f) => failure = f,
                            }
                        }
                    }
                }

                Tier::Remediate => {
                    tier = Tier::Agentic;
                    let has_builtin =
                        !remediate::builtin_prerequisites(&failure, &args).is_empty();
                    if !has_builtin && self.ctx.oracle.is_none() {
                        continue;
                    }
                    self.consume_budget(index)?;
                    let outcome =
                        match remediate::run(&self.ctx, &mut self.bindings, &failure, &args).await
                        {
                            Ok(outcome) => outcome,
                            Err(e) => return Err(self.anyhow_err(index, e)),
                        };
                    if let RemediateOutcome::RetryOriginal = outcome {
                        let mut recovered = false;
                        for attempt in 0..3u32 {
                            if attempt > 0
                                && !backoff_sleep(
                                    &self.ctx.cancel,
                                    self.ctx.timings.llm_backoff_base,
                                    attempt - 1,
                                )
                                .await
                            {
                                return Err(EngineError::Cancelled { index });
                            }
                            match self.retry(index, cmd, &args).await? {
                                DispatchResult::Success(_) => {
                                    recovered = true;
                                    break;
                                }
                                DispatchResult::Failed(f) => failure = f,
                            }
                        }
                        if recovered {
                            return Ok(StepDone::Succeeded);
                        }
                    }
                }

                Tier::Agentic => {
                    tier = Tier::Exhausted;
                    if self.ctx.oracle.is_none() {
                        continue;
                    }
                    self.consume_budget(index)?;
                    let outcome = match agentic::run(
                        &self.ctx,
                        &mut self.bindings,
                        cmd,
                        failure.clone(),
                        &args,
                    )
                    .await
                    {
                        Ok(outcome) => outcome,
                        Err(e) => return Err(self.anyhow_err(index, e)),
                    };
                    match outcome {
                        AgenticOutcome::Fixed => return Ok(StepDone::Succeeded),
                        AgenticOutcome::Skipped => return Ok(StepDone::Skipped),
                        AgenticOutcome::GaveUp(f) => failure = f,
                        AgenticOutcome::Unavailable => {}
                    }
                }

                Tier::Exhausted => {
                    return Err(EngineError::CommandFailed {
                        index,
                        service: failure.service.clone(),
                        op: failure.op.clone(),
                        code: failure.code_or_category(),
                        summary: summarize(&failure.message),
                    });
                }
            }
        }
    }

    /// Re-substitute and re-dispatch. A retry whose args still carry
    /// placeholders fails without touching the CLI.
    async fn retry(
        &mut self,
        index: usize,
        cmd: &PlanCommand,
        args: &[String],
    ) -> Result<DispatchResult, EngineError> {
        let mut retry_args = args.to_vec();
        let unresolved = subst::substitute(&mut retry_args, &self.bindings);
        if !unresolved.is_empty() {
            return Ok(DispatchResult::Failed(Failure::synthetic(
                retry_args.first().map(String::as_str).unwrap_or(""),
                retry_args.get(1).map(String::as_str).unwrap_or(""),
                format!("unresolved placeholders: {unresolved:?}"),
            )));
        }
        match dispatch_and_wait(&self.ctx, &mut self.bindings, cmd, &retry_args).await {
            Ok(result) => Ok(result),
            Err(e) => Err(self.anyhow_err(index, e)),
        }
    }

    fn consume_budget(&mut self, index: usize) -> Result<(), EngineError> {
        self.heal
            .try_consume(&self.policy)
            .map_err(|source| EngineError::Budget { index, source })
    }

    fn anyhow_err(&self, index: usize, e: anyhow::Error) -> EngineError {
        EngineError::Actuator {
            index,
            message: format!("{e:#}"),
        }
    }

    fn hard_fail_anyhow(
        &mut self,
        index: usize,
        _cmd: &PlanCommand,
        e: anyhow::Error,
    ) -> Result<(), EngineError> {
        self.record_failure(index);
        Err(self.anyhow_err(index, e))
    }

    fn mark_success(&mut self, index: usize) {
        self.progress.record_success(index, &mut self.bindings);
        self.save_checkpoint();
    }

    fn record_failure(&mut self, index: usize) {
        self.progress.record_failure(index, &mut self.bindings);
        self.save_checkpoint();
    }

    fn save_checkpoint(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&self.checkpoint_key, &self.bindings.snapshot()) {
                warn!(error = %e, "checkpoint write failed");
            }
        }
    }

    /// Best-effort lint: flag plans that bounce between regions.
    fn warn_region_zigzag(&mut self, args: &[String]) {
        if self.ctx.provider != Provider::Aws {
            return;
        }
        let (region, _) = clk_process::region_for(args, &self.ctx.region);
        if let Some(last) = &self.last_region {
            if *last != region {
                self.ctx.say(&format!(
                    "note: plan switches region {last} → {region}; verify this is intended"
                ));
            }
        }
        self.last_region = Some(region);
    }
}

/// Cheap pre-check used to gate the healing budget: does any glue rule even
/// claim this failure?
fn glue_matches(failure: &Failure) -> bool {
    match (failure.service.as_str(), failure.op.as_str()) {
        ("ec2", "associate-vpc-cidr-block") => {
            failure.code.as_deref() == Some("InvalidSubnet.Range")
                || failure
                    .message
                    .to_ascii_lowercase()
                    .contains("invalidsubnet.range")
        }
        ("cloudformation", "create-stack") | ("cloudformation", "update-stack") => {
            failure.category == FailureCategory::AlreadyExists
                || glue::cfn::is_cidr_failure(failure)
        }
        ("lambda", "create-function") => failure.category == FailureCategory::AlreadyExists,
        ("iam", "delete-role") => failure.category == FailureCategory::Conflict,
        ("apigateway", "delete-rest-api") => failure.category == FailureCategory::NotFound,
        _ => false,
    }
}

fn summarize(message: &str) -> String {
    let line = message
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim();
    if line.chars().count() > 200 {
        let truncated: String = line.chars().take(197).collect();
        format!("{truncated}...")
    } else {
        line.to_string()
    }
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
