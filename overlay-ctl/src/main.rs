//! overlay-ctl - drive an overlay agent from the command line.

mod client;
mod config;
mod error;
mod monitor;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client::AgentClient;
use config::CtlConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default internal storage target on the device.
const DEFAULT_TARGET: &str = "/tmp/upload";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Agent base URL (overrides OVERLAY_CTL_AGENT_URL)
    #[arg(short, long, global = true)]
    url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List storage targets
    Targets,
    /// Show the name the next backup will get
    Filename {
        #[arg(short, long, default_value = DEFAULT_TARGET)]
        target: PathBuf,
    },
    /// Create a backup
    Backup {
        #[arg(short, long, default_value = DEFAULT_TARGET)]
        target: PathBuf,
    },
    /// List backups at a target
    List {
        #[arg(short, long, default_value = DEFAULT_TARGET)]
        target: PathBuf,
    },
    /// Delete a backup
    Delete { path: PathBuf },
    /// Upload a local archive to the device
    Upload {
        file: PathBuf,
        #[arg(short, long, default_value = DEFAULT_TARGET)]
        target: PathBuf,
        /// Name on the device (defaults to the local file name)
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Download a backup from the device
    Download {
        path: PathBuf,
        /// Output file (defaults to the archive's file name)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Restore a backup
    Restore {
        path: PathBuf,
        /// Do not reboot after restoring
        #[arg(long)]
        no_reboot: bool,
        /// Return right after the reboot request instead of waiting
        #[arg(long)]
        no_wait: bool,
        /// Overall wait for the device, in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Wait for the device to answer its liveness probe
    Wait {
        #[arg(long)]
        timeout: Option<u64>,
    },
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&args.log_level))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    let mut config = CtlConfig::from_env()?;
    if let Some(url) = args.url {
        config.agent_url = url.trim_end_matches('/').to_string();
    }
    let client = AgentClient::new(&config.agent_url);

    match args.command {
        Command::Targets => print_json(&client.targets().await?)?,
        Command::Filename { target } => println!("{}", client.preview_filename(&target).await?),
        Command::Backup { target } => print_json(&client.create_backup(&target).await?)?,
        Command::List { target } => print_json(&client.list_backups(&target).await?)?,
        Command::Delete { path } => {
            client.delete_backup(&path).await?;
            println!("Deleted {}", path.display());
        }
        Command::Upload { file, target, name } => {
            let name = match name {
                Some(name) => name,
                None => file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .context("upload file has no file name")?,
            };
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            print_json(&client.upload_backup(bytes, &name, &target).await?)?;
        }
        Command::Download { path, output } => {
            let output = match output {
                Some(output) => output,
                None => PathBuf::from(path.file_name().context("archive path has no file name")?),
            };
            let bytes = client.download_backup(&path).await?;
            tokio::fs::write(&output, &bytes)
                .await
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Saved {} ({} bytes)", output.display(), bytes.len());
        }
        Command::Restore {
            path,
            no_reboot,
            no_wait,
            timeout,
        } => {
            let reply = client.restore(&path, !no_reboot).await?;
            print_json(&reply)?;
            if let Some(message) = &reply.message {
                tracing::warn!("{}", message);
            }
            if reply.reboot && !no_wait {
                let mut policy = config.policy;
                if let Some(secs) = timeout {
                    policy.timeout = Duration::from_secs(secs);
                }
                let waited = monitor::wait_for_device(&client, &policy).await?;
                println!("Device is back after {}s, restore complete", waited.as_secs());
            } else if !reply.reboot {
                println!("Restore complete. Reboot the device to apply it.");
            }
        }
        Command::Wait { timeout } => {
            let mut policy = config.policy;
            if let Some(secs) = timeout {
                policy.timeout = Duration::from_secs(secs);
            }
            let waited = monitor::wait_for_device(&client, &policy).await?;
            println!("Device is reachable after {}s", waited.as_secs());
        }
    }

    Ok(())
}
