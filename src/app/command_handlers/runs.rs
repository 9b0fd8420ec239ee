use crate::app::command_support::{
    reject_unknown_flags, request_context, run_summary_line, take_flag_value, take_switch,
    to_pretty_json, CliContext, CliError,
};
use crate::orchestration::engine::CancelOutcome;
use crate::orchestration::error::OrchestratorError;
use crate::orchestration::events::encode_frame;
use crate::orchestration::hub::{SubscriptionError, SubscriptionFilter};
use crate::orchestration::requests::{CreateRunRequest, RejectRunRequest, StopRunRequest};
use crate::orchestration::run::{RunFilter, RunStatus};
use crate::orchestration::{EventBody, Orchestrator};
use crate::runtime::{enqueue_start_request, open_orchestrator, StartRequest};
use crate::shared::clock::{Clock, SystemClock};
use serde_json::{json, Map, Value};
use std::fs;
use std::io::Write;
use std::time::Duration;

const EVENT_POLL: Duration = Duration::from_millis(200);

fn orchestrator(ctx: &CliContext) -> Result<Orchestrator, CliError> {
    Ok(open_orchestrator(&ctx.paths, &ctx.settings)?)
}

fn single_run_id<'a>(args: &'a [String], usage: &str) -> Result<&'a str, CliError> {
    match args {
        [run_id] => Ok(run_id.as_str()),
        _ => Err(CliError::usage(format!("usage: {usage}"))),
    }
}

fn optional_reason(words: &[String]) -> Option<String> {
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

pub fn cmd_create(ctx: &CliContext, args: &[String]) -> Result<String, CliError> {
    const USAGE: &str = "create [--tag T] [--profile P] <spec-json|@file>";
    let mut args = args.to_vec();
    let tag = take_flag_value(&mut args, "--tag")?;
    let profile = take_flag_value(&mut args, "--profile")?;
    reject_unknown_flags(&args)?;
    let [raw_spec] = args.as_slice() else {
        return Err(CliError::usage(format!("usage: {USAGE}")));
    };

    let raw_spec = match raw_spec.strip_prefix('@') {
        Some(path) => fs::read_to_string(path)
            .map_err(|err| CliError::usage(format!("failed to read spec file {path}: {err}")))?,
        None => raw_spec.clone(),
    };
    let spec: Value = serde_json::from_str(&raw_spec)
        .map_err(|err| CliError::usage(format!("spec is not valid JSON: {err}")))?;

    let mut body = Map::new();
    body.insert("spec".to_string(), spec);
    if let Some(tag) = tag {
        body.insert("tag".to_string(), Value::String(tag));
    }
    if let Some(profile) = profile {
        body.insert("profile_id".to_string(), Value::String(profile));
    }
    let request = CreateRunRequest::decode(&Value::Object(body))?;
    let run = orchestrator(ctx)?.create_run(&request_context(), request)?;
    Ok(run.id)
}

pub fn cmd_list(ctx: &CliContext, args: &[String]) -> Result<String, CliError> {
    let mut args = args.to_vec();
    let status = take_flag_value(&mut args, "--status")?;
    let active = take_switch(&mut args, "--active");
    reject_unknown_flags(&args)?;
    if !args.is_empty() {
        return Err(CliError::usage("usage: list [--status S] [--active]"));
    }

    let mut filter = if active {
        RunFilter::non_terminal()
    } else {
        RunFilter::default()
    };
    if let Some(status) = status {
        filter.status = Some(RunStatus::parse(&status).map_err(CliError::usage)?);
    }
    let runs = orchestrator(ctx)?.list_runs(&filter)?;
    if runs.is_empty() {
        return Ok("no runs".to_string());
    }
    Ok(runs
        .iter()
        .map(run_summary_line)
        .collect::<Vec<_>>()
        .join("\n"))
}

pub fn cmd_get(ctx: &CliContext, args: &[String]) -> Result<String, CliError> {
    let run_id = single_run_id(args, "get <run_id>")?;
    let run = orchestrator(ctx)?.get_run(run_id)?;
    to_pretty_json(&run)
}

pub fn cmd_history(ctx: &CliContext, args: &[String]) -> Result<String, CliError> {
    let run_id = single_run_id(args, "history <run_id>")?;
    let history = orchestrator(ctx)?.get_history(run_id)?;
    let mut lines = Vec::with_capacity(history.len());
    for entry in &history {
        lines.push(
            serde_json::to_string(entry)
                .map_err(|err| CliError::usage(format!("failed to encode history: {err}")))?,
        );
    }
    Ok(lines.join("\n"))
}

/// Foreground start streams the run's events to `out` until it settles.
pub fn cmd_start(ctx: &CliContext, args: &[String], out: &mut dyn Write) -> Result<String, CliError> {
    let mut args = args.to_vec();
    let detach = take_switch(&mut args, "--detach");
    reject_unknown_flags(&args)?;
    let run_id = single_run_id(&args, "start <run_id> [--detach]")?;
    let orchestrator = orchestrator(ctx)?;
    let request = request_context();

    if detach {
        let run = orchestrator.get_run(run_id)?;
        if run.status.is_terminal() {
            return Err(OrchestratorError::Terminal {
                run_id: run.id,
                status: run.status,
            }
            .into());
        }
        if run.status != RunStatus::Pending {
            return Err(OrchestratorError::AlreadyRunning {
                run_id: run.id,
                status: run.status,
            }
            .into());
        }
        enqueue_start_request(
            &ctx.paths,
            &StartRequest {
                run_id: run.id.clone(),
                actor: request.actor().to_string(),
                requested_at: SystemClock.now_millis(),
            },
        )?;
        return Ok(format!("start of {} handed to serve", run.id));
    }

    let subscription = orchestrator.subscribe(SubscriptionFilter::runs([run_id]))?;
    orchestrator.start(&request, run_id)?;
    loop {
        match subscription.recv_timeout(EVENT_POLL) {
            Ok(event) => {
                if event.kind().is_hub_originated() {
                    continue;
                }
                if let Ok(frame) = encode_frame(&event) {
                    let _ = writeln!(out, "{frame}");
                    let _ = out.flush();
                }
                if matches!(event.body, EventBody::Terminal { .. }) {
                    break;
                }
            }
            Err(SubscriptionError::Timeout) => {
                if orchestrator.get_run(run_id)?.status.is_terminal() {
                    break;
                }
            }
            Err(SubscriptionError::Closed(_)) => break,
        }
    }
    orchestrator.join_worker(run_id);
    let run = orchestrator.get_run(run_id)?;
    Ok(run_summary_line(&run))
}

pub fn cmd_stop(ctx: &CliContext, args: &[String]) -> Result<String, CliError> {
    let Some((run_id, reason)) = args.split_first() else {
        return Err(CliError::usage("usage: stop <run_id> [reason]"));
    };
    let request = StopRunRequest::decode(&json!({
        "run_id": run_id,
        "reason": optional_reason(reason),
    }))?;
    let outcome = orchestrator(ctx)?.stop_request(&request_context(), &request)?;
    Ok(format!("{}: {}", request.run_id, describe_cancel(outcome)))
}

pub fn cmd_stop_all(ctx: &CliContext, args: &[String]) -> Result<String, CliError> {
    reject_unknown_flags(args)?;
    let reason = optional_reason(args).unwrap_or_else(|| "user".to_string());
    let outcomes = orchestrator(ctx)?.stop_all(&request_context(), &reason)?;
    if outcomes.is_empty() {
        return Ok("no active runs".to_string());
    }
    Ok(outcomes
        .iter()
        .map(|(run_id, outcome)| format!("{run_id}: {}", describe_cancel(*outcome)))
        .collect::<Vec<_>>()
        .join("\n"))
}

pub fn cmd_approve(ctx: &CliContext, args: &[String]) -> Result<String, CliError> {
    let run_id = single_run_id(args, "approve <run_id>")?;
    let run = orchestrator(ctx)?.approve(&request_context(), run_id)?;
    Ok(run_summary_line(&run))
}

pub fn cmd_reject(ctx: &CliContext, args: &[String]) -> Result<String, CliError> {
    let Some((run_id, reason)) = args.split_first() else {
        return Err(CliError::usage("usage: reject <run_id> [reason]"));
    };
    let request = RejectRunRequest::decode(&json!({
        "run_id": run_id,
        "reason": optional_reason(reason),
    }))?;
    let run = orchestrator(ctx)?.reject_request(&request_context(), &request)?;
    Ok(run_summary_line(&run))
}

fn describe_cancel(outcome: CancelOutcome) -> &'static str {
    match outcome {
        CancelOutcome::Cancelled => "cancelled",
        CancelOutcome::Stopping => "stopping",
        CancelOutcome::AlreadyStopping => "already stopping",
        CancelOutcome::AlreadyTerminal => "already terminal",
    }
}
