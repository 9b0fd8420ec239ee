use crate::app::command_support::{
    reject_unknown_flags, take_flag_value, take_switch, CliContext, CliError,
};
use crate::runtime::{load_daemon_state, serve, signal_stop, watch_events, WatchOptions};
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

pub fn cmd_serve(ctx: &CliContext, args: &[String]) -> Result<String, CliError> {
    if !args.is_empty() {
        return Err(CliError::usage("usage: serve"));
    }
    let state = serve(&ctx.paths, &ctx.settings, Arc::new(AtomicBool::new(false)))?;
    Ok(format!(
        "serve stopped: recovered_runs={} started_runs={}",
        state.recovered_runs, state.started_runs
    ))
}

pub fn cmd_shutdown(ctx: &CliContext, args: &[String]) -> Result<String, CliError> {
    if !args.is_empty() {
        return Err(CliError::usage("usage: shutdown"));
    }
    signal_stop(&ctx.paths)?;
    Ok("stop requested".to_string())
}

pub fn cmd_watch(ctx: &CliContext, args: &[String], out: &mut dyn Write) -> Result<String, CliError> {
    const USAGE: &str =
        "usage: watch [--run ID]... [--all] [--addr A] [--count N] [--timeout-ms MS]";
    let mut args = args.to_vec();
    let mut runs = Vec::new();
    while let Some(run_id) = take_flag_value(&mut args, "--run")? {
        runs.push(run_id);
    }
    let all = take_switch(&mut args, "--all");
    let addr = take_flag_value(&mut args, "--addr")?;
    let count = take_flag_value(&mut args, "--count")?
        .map(|raw| parse_number(&raw, "--count"))
        .transpose()?;
    let timeout = take_flag_value(&mut args, "--timeout-ms")?
        .map(|raw| parse_number(&raw, "--timeout-ms").map(|ms| Duration::from_millis(ms as u64)))
        .transpose()?;
    reject_unknown_flags(&args)?;
    if !args.is_empty() || (runs.is_empty() && !all) {
        return Err(CliError::usage(USAGE));
    }

    let addr = match addr {
        Some(addr) => addr,
        None => resolve_server_addr(ctx)?,
    };
    let options = WatchOptions {
        until_terminal: !runs.is_empty() && !all,
        runs,
        all,
        max_events: count,
        timeout,
    };
    let written = watch_events(&addr, &options, out)?;
    Ok(format!("watched {written} events"))
}

/// Prefers the address a running `serve` recorded over the configured bind.
fn resolve_server_addr(ctx: &CliContext) -> Result<String, CliError> {
    let recorded = load_daemon_state(&ctx.paths)?
        .filter(|state| state.running)
        .and_then(|state| state.addr);
    Ok(recorded.unwrap_or_else(|| ctx.settings.server.bind.clone()))
}

fn parse_number(raw: &str, flag: &str) -> Result<usize, CliError> {
    raw.parse::<usize>()
        .map_err(|_| CliError::usage(format!("{flag} expects a non-negative integer")))
}
