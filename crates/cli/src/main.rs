//! portage - queue file transfers to a portage daemon
//!
//! Enqueues copy/move/convert jobs, controls queue processing and inspects
//! progress. When no daemon is running, enqueue and start commands launch
//! one and wait for it to become ready.

mod client;
mod expand;

use clap::{Args, Parser, Subcommand, ValueEnum};
use client::{ClientError, DaemonClient};
use expand::{expand_sources, group_consecutive};
use portage_daemon::server::{EnqueueRequest, FlushRequest};
use portage_daemon::{Conditions, FlushScope, Operation};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;

/// portage - queue copy/move/convert jobs for a target device
#[derive(Parser, Debug)]
#[command(name = "portage")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Daemon control port
    #[arg(long, default_value_t = 9393)]
    port: u16,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Enqueue copy jobs; the last path is the destination directory
    Copy(TransferArgs),
    /// Enqueue move jobs; the last path is the destination directory
    Move(TransferArgs),
    /// Enqueue conversion jobs; the last path is the destination directory
    Convert(ConvertArgs),
    /// Start processing the focused queue
    Start,
    /// Pause processing; in-flight work drains without committing
    Pause,
    /// Stop processing and checkpoint a resumable snapshot
    Stop,
    /// Show daemon state and last error
    Status,
    /// Show progress of the focused queue
    Progress,
    /// Clear jobs from a queue
    Flush {
        /// What to clear
        #[arg(value_enum, default_value_t = ScopeArg::Pending)]
        scope: ScopeArg,
        /// Target queue (focused queue if omitted)
        #[arg(long)]
        queue: Option<String>,
    },
    /// List queue names
    Queues,
    /// Select the focused queue
    Select {
        name: String,
    },
    /// Manage the daemon process
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
}

#[derive(Args, Debug)]
struct TransferArgs {
    /// Source files/directories followed by the destination directory
    #[arg(required = true, num_args = 2..)]
    paths: Vec<PathBuf>,

    /// Only transfer files with these extensions (comma separated)
    #[arg(long, value_delimiter = ',')]
    include: Vec<String>,

    /// Skip files with these extensions (comma separated)
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,

    /// Target a named queue instead of replacing the default one
    #[arg(long)]
    queue: Option<String>,

    /// Enqueue without starting processing
    #[arg(long)]
    enqueue_only: bool,
}

#[derive(Args, Debug)]
struct ConvertArgs {
    #[command(flatten)]
    transfer: TransferArgs,

    /// Only transcode these extensions; everything else passes through as a
    /// plain copy (comma separated)
    #[arg(long, value_delimiter = ',')]
    convert_only: Vec<String>,

    /// Transcode profile name (daemon default if omitted)
    #[arg(long)]
    profile: Option<String>,

    /// Strip embedded album art from transferred files
    #[arg(long)]
    remove_art: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ScopeArg {
    Pending,
    Failed,
    All,
}

impl From<ScopeArg> for FlushScope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::Pending => FlushScope::Pending,
            ScopeArg::Failed => FlushScope::Failed,
            ScopeArg::All => FlushScope::All,
        }
    }
}

#[derive(Subcommand, Debug)]
enum DaemonAction {
    /// Launch a daemon if none is running
    Start,
    /// Ask the running daemon to checkpoint and exit
    Stop,
    /// Check whether a daemon is reachable
    Status,
}

/// Normalize `--include mp3,.FLAC` style lists into the daemon's extension
/// set format: lowercase, no leading dot.
fn ext_set(list: &[String]) -> BTreeSet<String> {
    list.iter()
        .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

fn absolutize(path: &PathBuf) -> Result<PathBuf, ClientError> {
    if path.is_absolute() {
        Ok(path.clone())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn fmt_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

async fn run_transfer(
    client: &DaemonClient,
    operation: Operation,
    args: &TransferArgs,
    conditions: Conditions,
) -> Result<(), ClientError> {
    let (sources, destination) = args
        .paths
        .split_at(args.paths.len() - 1);
    let destination = absolutize(&destination[0])?;

    client.ensure_daemon().await?;

    let expanded = expand_sources(sources, &destination)?;
    if expanded.is_empty() {
        println!("nothing to enqueue");
        return Ok(());
    }

    // A plain invocation replaces the default queue; targeting a named
    // queue appends.
    let replace_default = args.queue.is_none();
    let mut first = true;
    let mut total = 0;

    for (dest_dir, files) in group_consecutive(expanded) {
        let response = client
            .enqueue(&EnqueueRequest {
                queue: args.queue.clone(),
                reset: replace_default && first,
                operation,
                sources: files,
                destination: dest_dir,
                conditions: conditions.clone(),
            })
            .await?;
        total += response.job_ids.len();
        first = false;
    }

    println!("enqueued {} job(s)", total);

    if !args.enqueue_only {
        client.start().await?;
        println!("processing started");
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<(), ClientError> {
    let client = DaemonClient::new(cli.port);

    match cli.command {
        CliCommand::Copy(args) => {
            let conditions = Conditions {
                include: ext_set(&args.include),
                exclude: ext_set(&args.exclude),
                ..Default::default()
            };
            run_transfer(&client, Operation::Copy, &args, conditions).await
        }
        CliCommand::Move(args) => {
            let conditions = Conditions {
                include: ext_set(&args.include),
                exclude: ext_set(&args.exclude),
                ..Default::default()
            };
            run_transfer(&client, Operation::Move, &args, conditions).await
        }
        CliCommand::Convert(args) => {
            let conditions = Conditions {
                include: ext_set(&args.transfer.include),
                exclude: ext_set(&args.transfer.exclude),
                convert_only: ext_set(&args.convert_only),
                remove_art: args.remove_art,
                profile: args.profile.clone(),
            };
            run_transfer(&client, Operation::Convert, &args.transfer, conditions).await
        }
        CliCommand::Start => {
            client.ensure_daemon().await?;
            client.start().await?;
            println!("processing started");
            Ok(())
        }
        CliCommand::Pause => {
            client.pause().await?;
            println!("processing paused");
            Ok(())
        }
        CliCommand::Stop => {
            client.stop().await?;
            println!("processing stopped");
            Ok(())
        }
        CliCommand::Status => {
            let status = client.status().await?;
            println!("state: {}", status.state);
            println!("queue: {}", status.queue);
            println!(
                "jobs: {} pending | {} running | {} done | {} skipped | {} failed",
                status.counts.pending,
                status.counts.running,
                status.counts.done,
                status.counts.skipped,
                status.counts.failed,
            );
            if let Some(id) = status.current_job_id {
                println!("current job: {}", id);
            }
            if let Some(error) = status.last_error {
                println!("last error: {}", error);
            }
            Ok(())
        }
        CliCommand::Progress => {
            let progress = client.progress().await?;
            println!(
                "{}/{} done ({:.1}%) | pending {} | running {} | skipped {} | failed {}",
                progress.done,
                progress.total - progress.skipped,
                progress.percent,
                progress.pending,
                progress.running,
                progress.skipped,
                progress.failed,
            );
            println!(
                "{} of {} transferred",
                fmt_bytes(progress.bytes_done),
                fmt_bytes(progress.bytes_total)
            );
            if let Some(id) = progress.current_job_id {
                println!("current job: {}", id);
            }
            Ok(())
        }
        CliCommand::Flush { scope, queue } => {
            let outcome = client
                .flush(&FlushRequest {
                    queue,
                    scope: scope.into(),
                })
                .await?;
            println!("removed {} job(s), reset {} job(s)", outcome.removed, outcome.reset);
            Ok(())
        }
        CliCommand::Queues => {
            let queues = client.queues().await?;
            for name in queues.names {
                println!("{}", name);
            }
            Ok(())
        }
        CliCommand::Select { name } => {
            client.select_queue(name.clone()).await?;
            println!("selected queue '{}'", name);
            Ok(())
        }
        CliCommand::Daemon { action } => match action {
            DaemonAction::Start => {
                if client.ping().await {
                    println!("daemon is already running");
                } else {
                    client.ensure_daemon().await?;
                    println!("daemon started");
                }
                Ok(())
            }
            DaemonAction::Stop => {
                if client.ping().await {
                    client.shutdown().await?;
                    println!("daemon stopped");
                } else {
                    println!("daemon is not running");
                }
                Ok(())
            }
            DaemonAction::Status => {
                if client.ping().await {
                    println!("daemon is running");
                } else {
                    println!("daemon is not running");
                }
                Ok(())
            }
        },
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ext_set_normalizes() {
        let set = ext_set(&[
            "mp3".to_string(),
            ".FLAC".to_string(),
            "".to_string(),
            "Ogg".to_string(),
        ]);
        let expected: BTreeSet<String> =
            ["mp3", "flac", "ogg"].iter().map(|s| s.to_string()).collect();
        assert_eq!(set, expected);
    }

    #[test]
    fn test_fmt_bytes() {
        assert_eq!(fmt_bytes(512), "512 B");
        assert_eq!(fmt_bytes(2048), "2.0 KiB");
        assert_eq!(fmt_bytes(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn test_scope_arg_maps_to_flush_scope() {
        assert_eq!(FlushScope::from(ScopeArg::Pending), FlushScope::Pending);
        assert_eq!(FlushScope::from(ScopeArg::Failed), FlushScope::Failed);
        assert_eq!(FlushScope::from(ScopeArg::All), FlushScope::All);
    }

    #[test]
    fn test_cli_parses_convert_flags() {
        let cli = Cli::parse_from([
            "portage",
            "convert",
            "/music",
            "/mnt/player",
            "--convert-only",
            "flac,wav",
            "--include",
            "mp3,flac,wav",
            "--remove-art",
            "--enqueue-only",
        ]);

        match cli.command {
            CliCommand::Convert(args) => {
                assert_eq!(args.transfer.paths.len(), 2);
                assert_eq!(ext_set(&args.convert_only).len(), 2);
                assert!(args.remove_art);
                assert!(args.transfer.enqueue_only);
                assert!(args.profile.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
