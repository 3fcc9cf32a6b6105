//! Drives a single node through its three-phase lifecycle with policy
//! application (C4, spec §4.3). [`crate::graph::Graph::run`] loops this
//! function across successor edges; this module only concerns itself with
//! one node visit.

use crate::action::Action;
use crate::context::Ctx;
use crate::error::{Phase, PocketError, PocketResult};
use crate::node::{BoxError, Node};
use crate::store::Store;
use crate::value::Value;
use tracing::instrument;

fn phase_execution(node: &Node, phase: Phase, err: BoxError) -> PocketError {
    PocketError::PhaseExecution {
        node: node.name().to_string(),
        phase,
        message: err.to_string(),
    }
}

fn input_validation(node: &Node, phase: Phase, message: String) -> PocketError {
    PocketError::InputValidation {
        node: node.name().to_string(),
        phase,
        message,
    }
}

fn output_validation(node: &Node, message: String) -> PocketError {
    PocketError::OutputValidation {
        node: node.name().to_string(),
        phase: Phase::OutputValidation,
        message,
    }
}

fn exec_failure(node: &Node, err: BoxError) -> PocketError {
    PocketError::ExecFailure {
        node: node.name().to_string(),
        phase: Phase::Exec,
        message: err.to_string(),
    }
}

fn timeout_error(node: &Node, elapsed_ms: u64) -> PocketError {
    PocketError::Timeout {
        node: node.name().to_string(),
        phase: Phase::Exec,
        elapsed_ms,
    }
}

fn cancelled(node: &Node, phase: Phase) -> PocketError {
    PocketError::Cancelled {
        node: node.name().to_string(),
        phase,
    }
}

/// Outcome of driving one node visit: the Post-chosen output plus the
/// action it picked (spec §3, "Sum-typed phase outcomes").
pub struct NodeOutcome {
    pub output: Value,
    pub action: Action,
}

/// Runs Prep -> Exec (with timeout/retry/fallback) -> Post for one node
/// visit, firing hooks exactly once, per spec §4.3 steps 2-7.
#[instrument(level = "debug", skip_all, fields(node = node.name()))]
pub async fn run_node(node: &Node, store: &Store, ctx: &Ctx, input: Value) -> PocketResult<NodeOutcome> {
    let reader = store.reader();
    let writer = store.writer();
    let policies = node.policies();

    if let Some(validator) = &policies.input_validator {
        if let Err(message) = validator(&input) {
            let err = input_validation(node, Phase::InputValidation, message);
            fire_failure_hooks(node, &writer, &err).await;
            return Err(err);
        }
    }

    if ctx.is_cancelled() {
        let err = cancelled(node, Phase::Prep);
        fire_failure_hooks(node, &writer, &err).await;
        return Err(err);
    }

    let prep_result = match node.backend().prep(ctx, &reader, input.clone()).await {
        Ok(v) => v,
        Err(e) => {
            let err = phase_execution(node, Phase::Prep, e);
            fire_failure_hooks(node, &writer, &err).await;
            return Err(err);
        }
    };

    let exec_result = match run_exec_with_policies(node, ctx, prep_result.clone()).await {
        Ok(v) => v,
        Err(err) => {
            fire_failure_hooks(node, &writer, &err).await;
            return Err(err);
        }
    };

    if let Some(validator) = &policies.output_validator {
        if let Err(message) = validator(&exec_result) {
            let err = output_validation(node, message);
            fire_failure_hooks(node, &writer, &err).await;
            return Err(err);
        }
    }

    let (output, action) = match node
        .backend()
        .post(ctx, &writer, input, prep_result, exec_result)
        .await
    {
        Ok(v) => v,
        Err(e) => {
            let err = phase_execution(node, Phase::Post, e);
            fire_failure_hooks(node, &writer, &err).await;
            return Err(err);
        }
    };

    if let Some(hook) = &policies.on_success {
        hook(writer.clone(), output.clone()).await;
    }
    if let Some(hook) = &policies.on_complete {
        hook(writer).await;
    }

    Ok(NodeOutcome { output, action })
}

async fn fire_failure_hooks(node: &Node, writer: &crate::store::StoreWriter, err: &PocketError) {
    let policies = node.policies();
    if let Some(hook) = &policies.on_failure {
        let reported: BoxError = err.to_string().into();
        hook(writer.clone(), reported).await;
    }
    if let Some(hook) = &policies.on_complete {
        hook(writer.clone()).await;
    }
}

/// input-validator -> timeout -> retry(fallback(Exec)) -> output-validator
/// (spec §4.2, "Policy application order"). Timeout wraps the *whole*
/// retry/fallback pipeline, not each individual attempt.
async fn run_exec_with_policies(node: &Node, ctx: &Ctx, prep_result: Value) -> PocketResult<Value> {
    let policies = node.policies();
    let exec_ctx = match policies.timeout {
        Some(d) => ctx.child_with_timeout(d),
        None => ctx.child(),
    };

    let max_attempts = policies.retry.as_ref().map(|r| r.max_attempts).unwrap_or(1);
    let mut last_err: Option<BoxError> = None;
    let mut timed_out = false;

    for attempt in 1..=max_attempts {
        if exec_ctx.is_cancelled() {
            return Err(cancelled(node, Phase::Exec));
        }
        if exec_ctx.is_timed_out() {
            // The shared timeout deadline (it wraps the whole
            // retry/fallback pipeline, not each attempt) already elapsed
            // on a prior iteration; any further race against `exec_ctx`
            // would resolve to `None` instantly, which is a timeout, not
            // a cancellation. Stop retrying now rather than let that
            // show up misclassified below.
            break;
        }

        let attempt_outcome = exec_ctx.race(node.backend().exec(&exec_ctx, prep_result.clone())).await;

        let failure = match attempt_outcome {
            Some(Ok(v)) => return Ok(v),
            Some(Err(e)) => e,
            None => {
                if exec_ctx.is_cancelled() {
                    return Err(cancelled(node, Phase::Exec));
                }
                timed_out = true;
                "exec timed out".into()
            }
        };

        if let Some(fallback) = &policies.fallback {
            match fallback(ctx.clone(), prep_result.clone(), failure).await {
                Ok(v) => return Ok(v),
                Err(e2) => last_err = Some(e2),
            }
        } else {
            last_err = Some(failure);
        }

        if timed_out {
            // Same reasoning as above: the pipeline deadline has passed,
            // so a backoff sleep raced against `exec_ctx` would return
            // `None` immediately and read as a cancellation. Surface the
            // timeout directly instead of attempting (and misreporting)
            // a sleep that cannot complete.
            break;
        }

        if attempt < max_attempts {
            if let Some(retry) = &policies.retry {
                let delay = retry.delay_for_attempt(attempt);
                if !delay.is_zero() && exec_ctx.race(tokio::time::sleep(delay)).await.is_none() {
                    if exec_ctx.is_cancelled() {
                        return Err(cancelled(node, Phase::Exec));
                    }
                    timed_out = true;
                    break;
                }
            }
        }
    }

    if timed_out {
        Err(timeout_error(
            node,
            policies.timeout.map(|d| d.as_millis() as u64).unwrap_or(0),
        ))
    } else {
        Err(exec_failure(node, last_err.unwrap_or_else(|| "exec failed".into())))
    }
}
