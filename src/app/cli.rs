#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliVerb {
    Create,
    List,
    Get,
    History,
    Start,
    Stop,
    StopAll,
    Approve,
    Reject,
    Watch,
    Serve,
    Shutdown,
    Profiles,
    Help,
    Unknown,
}

pub fn parse_cli_verb(input: &str) -> CliVerb {
    match input {
        "create" => CliVerb::Create,
        "list" => CliVerb::List,
        "get" => CliVerb::Get,
        "history" => CliVerb::History,
        "start" => CliVerb::Start,
        "stop" => CliVerb::Stop,
        "stop-all" => CliVerb::StopAll,
        "approve" => CliVerb::Approve,
        "reject" => CliVerb::Reject,
        "watch" => CliVerb::Watch,
        "serve" => CliVerb::Serve,
        "shutdown" => CliVerb::Shutdown,
        "profiles" => CliVerb::Profiles,
        "help" | "--help" | "-h" => CliVerb::Help,
        _ => CliVerb::Unknown,
    }
}

pub fn cli_help_lines() -> Vec<String> {
    vec![
        "Usage: runcast [--config <path>] [--state-root <path>] <command> ...".to_string(),
        String::new(),
        "Commands:".to_string(),
        "  create [--tag T] [--profile P] <spec-json>   Persist a pending run".to_string(),
        "  list [--status S] [--active]                  List runs, newest first".to_string(),
        "  get <run_id>                                  Show one run record".to_string(),
        "  history <run_id>                              Show a run's history".to_string(),
        "  start <run_id> [--detach]                     Drive a run (or hand it to serve)"
            .to_string(),
        "  stop <run_id> [reason]                        Cancel a run".to_string(),
        "  stop-all [reason]                             Cancel every non-terminal run"
            .to_string(),
        "  approve <run_id>                              Resume a run awaiting approval"
            .to_string(),
        "  reject <run_id> [reason]                      Reject a run awaiting approval"
            .to_string(),
        "  watch [--run ID]... [--all] [--addr A] [--count N] [--timeout-ms MS]".to_string(),
        "                                                Stream events from serve".to_string(),
        "  serve                                         Host the event server and start requests"
            .to_string(),
        "  shutdown                                      Ask a running serve to stop".to_string(),
        "  profiles list|create|rename|delete|touch|recent".to_string(),
        "                                                Manage session profiles".to_string(),
    ]
}

pub(crate) fn help_text() -> String {
    cli_help_lines().join("\n")
}
