use crate::app::command_support::{to_pretty_json, CliContext, CliError};
use crate::profiles::{Profile, ProfileStore};
use crate::runtime::bootstrap_state_root;
use crate::shared::clock::format_millis_rfc3339;
use crate::shared::logging::Logger;

const USAGE: &str =
    "usage: profiles <list|create [name]|rename <id> [name]|delete <id>|touch <id>|recent>";

fn store(ctx: &CliContext) -> Result<ProfileStore, CliError> {
    bootstrap_state_root(&ctx.paths)?;
    Ok(ProfileStore::new(ctx.paths.profiles_dir())
        .with_logger(Logger::to_file(ctx.paths.runtime_log_path())))
}

fn profile_line(profile: &Profile) -> String {
    format!(
        "{}\t{}\t{}",
        profile.id,
        profile.display_name,
        format_millis_rfc3339(profile.last_used_at)
    )
}

pub fn cmd_profiles(ctx: &CliContext, args: &[String]) -> Result<String, CliError> {
    let Some((action, rest)) = args.split_first() else {
        return Err(CliError::usage(USAGE));
    };
    let store = store(ctx)?;
    match (action.as_str(), rest) {
        ("list", []) => {
            let profiles = store.list()?;
            if profiles.is_empty() {
                return Ok("no profiles".to_string());
            }
            Ok(profiles
                .iter()
                .map(profile_line)
                .collect::<Vec<_>>()
                .join("\n"))
        }
        ("create", name) => {
            let profile = store.create(&name.join(" "))?;
            Ok(profile_line(&profile))
        }
        ("rename", [profile_id, name @ ..]) => {
            let profile = store.rename(profile_id, &name.join(" "))?;
            Ok(profile_line(&profile))
        }
        ("delete", [profile_id]) => {
            store.delete(profile_id)?;
            Ok(format!("deleted {profile_id}"))
        }
        ("touch", [profile_id]) => Ok(profile_line(&store.touch(profile_id)?)),
        ("recent", []) => match store.most_recent()? {
            Some(profile) => to_pretty_json(&profile),
            None => Ok("no profiles".to_string()),
        },
        _ => Err(CliError::usage(USAGE)),
    }
}
