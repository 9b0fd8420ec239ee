use crate::app::cli::{help_text, parse_cli_verb, CliVerb};
use crate::app::command_support::{split_global_options, CliContext, CliError};
use std::io::Write;

pub mod daemon;
pub mod profiles;
pub mod runs;

/// Runs one command, buffering any streamed output into the returned text.
pub fn run_cli(args: Vec<String>) -> Result<String, CliError> {
    let mut streamed = Vec::new();
    let output = run_cli_with_output(args, &mut streamed)?;
    let mut text = String::from_utf8_lossy(&streamed).into_owned();
    text.push_str(&output);
    Ok(text)
}

/// Runs one command. Streaming commands (`start`, `watch`) write events to
/// `out` as they arrive; the returned text is printed after.
pub fn run_cli_with_output(args: Vec<String>, out: &mut dyn Write) -> Result<String, CliError> {
    let (options, args) = split_global_options(&args)?;
    let Some(verb) = args.first() else {
        return Ok(help_text());
    };
    let verb_args = &args[1..];

    match parse_cli_verb(verb) {
        CliVerb::Help => Ok(help_text()),
        CliVerb::Unknown => Err(CliError::usage(format!("unknown command `{verb}`"))),
        known => {
            let ctx = CliContext::load(&options)?;
            match known {
                CliVerb::Create => runs::cmd_create(&ctx, verb_args),
                CliVerb::List => runs::cmd_list(&ctx, verb_args),
                CliVerb::Get => runs::cmd_get(&ctx, verb_args),
                CliVerb::History => runs::cmd_history(&ctx, verb_args),
                CliVerb::Start => runs::cmd_start(&ctx, verb_args, out),
                CliVerb::Stop => runs::cmd_stop(&ctx, verb_args),
                CliVerb::StopAll => runs::cmd_stop_all(&ctx, verb_args),
                CliVerb::Approve => runs::cmd_approve(&ctx, verb_args),
                CliVerb::Reject => runs::cmd_reject(&ctx, verb_args),
                CliVerb::Watch => daemon::cmd_watch(&ctx, verb_args, out),
                CliVerb::Serve => daemon::cmd_serve(&ctx, verb_args),
                CliVerb::Shutdown => daemon::cmd_shutdown(&ctx, verb_args),
                CliVerb::Profiles => profiles::cmd_profiles(&ctx, verb_args),
                CliVerb::Help | CliVerb::Unknown => Ok(help_text()),
            }
        }
    }
}
