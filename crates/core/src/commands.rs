//! Command-file channel for collaborators that cannot call the service
//! directly (payment webhook relay, delivery frontend).
//!
//! Each `*.json` file in the command directory holds one command. Processed
//! files are deleted; files that cannot be parsed or applied are renamed to
//! `*.rejected` so they are not retried forever.

use std::fs;
use std::path::Path;
use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use crate::context::ServiceContext;
use crate::identity::Identity;
use crate::job::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    GrantPremium,
    RevokePremium,
    /// The client fetched its output; free the job's files
    Delivered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFile {
    pub action: CommandAction,
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Apply one command to the service
pub fn apply_command(ctx: &ServiceContext, cmd: &CommandFile) -> Result<()> {
    match cmd.action {
        CommandAction::GrantPremium | CommandAction::RevokePremium => {
            let raw = cmd
                .identity
                .as_deref()
                .ok_or_else(|| anyhow!("{:?} requires an identity", cmd.action))?;
            let identity = Identity::new(raw)?;
            let changed = if cmd.action == CommandAction::GrantPremium {
                ctx.grant_premium(&identity)?
            } else {
                ctx.revoke_premium(&identity)?
            };
            if !changed {
                debug!("{:?} for {} was a no-op", cmd.action, identity);
            }
        }
        CommandAction::Delivered => {
            let raw = cmd
                .job_id
                .as_deref()
                .ok_or_else(|| anyhow!("delivered requires a job_id"))?;
            let job_id = JobId::parse(raw).ok_or_else(|| anyhow!("invalid job id: {}", raw))?;
            if !ctx.finish_delivery(job_id)? {
                debug!("Job {}: already delivered", job_id);
            }
        }
    }
    Ok(())
}

/// Consume every command file in `command_dir`. Returns how many were applied.
pub fn process_command_files(command_dir: &Path, ctx: &ServiceContext) -> Result<usize> {
    if !command_dir.exists() {
        fs::create_dir_all(command_dir)
            .with_context(|| format!("Failed to create command directory: {}", command_dir.display()))?;
    }

    let entries = match fs::read_dir(command_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Failed to read command directory {}: {}", command_dir.display(), e);
            return Ok(0);
        }
    };

    let mut paths: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
        .collect();
    // File names usually start with a timestamp; keep their order
    paths.sort();

    let mut processed = 0;
    for path in paths {
        let outcome = fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|content| serde_json::from_str::<CommandFile>(&content).map_err(anyhow::Error::from))
            .and_then(|cmd| apply_command(ctx, &cmd).map(|_| cmd));

        match outcome {
            Ok(cmd) => {
                info!("Applied command {:?} from {}", cmd.action, path.display());
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to delete processed command file: {}", path.display()))?;
                processed += 1;
            }
            Err(e) => {
                warn!("Rejected command file {}: {:#}", path.display(), e);
                let rejected = path.with_extension("rejected");
                fs::rename(&path, &rejected)
                    .with_context(|| format!("Failed to set aside command file: {}", path.display()))?;
            }
        }
    }

    if processed > 0 {
        info!("✅ Processed {} command file(s)", processed);
    }
    Ok(processed)
}
