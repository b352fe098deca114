//! Command line frontend for the print farm orchestrator.

#![deny(missing_docs)]

use anyhow::{bail, Context, Result};
use clap::Parser;
use uuid::Uuid;

use print_farm::{Event, FarmConfig, FileRef, JobStatus, Orchestrator};

/// This doc string acts as a help message when the user runs '--help'
/// as do all doc strings on fields.
#[derive(Parser, Debug, Clone)]
#[clap(version = clap::crate_version!(), author = clap::crate_authors!("\n"))]
pub struct Opts {
    /// Print debug info
    #[clap(short, long)]
    pub debug: bool,

    /// Print logs as json
    #[clap(short, long)]
    pub json: bool,

    /// The subcommand to run.
    #[clap(subcommand)]
    pub subcmd: SubCommand,

    /// Path to config file.
    #[clap(short, long, default_value = "print-farm.toml")]
    pub config: std::path::PathBuf,
}

/// A subcommand for our cli.
#[derive(Parser, Debug, Clone)]
pub enum SubCommand {
    /// List every configured device.
    List,

    /// Get a device's runtime status.
    Status {
        /// Id of the device.
        device_id: String,
    },

    /// Connect a device and wait for the handshake.
    Connect {
        /// Id of the device.
        device_id: String,
    },

    /// Send one raw command and print the response.
    Send {
        /// Id of the device.
        device_id: String,

        /// The command to send.
        command: String,
    },

    /// Queue a file for printing and follow it to completion.
    Print {
        /// Id of the device.
        device_id: String,

        /// File to print.
        file: std::path::PathBuf,

        /// Job priority, 0 (lowest) to 10 (highest).
        #[clap(long, default_value_t = 5)]
        priority: u8,
    },

    /// Pause a printing job.
    Pause {
        /// Id of the job.
        job_id: Uuid,
    },

    /// Resume a paused job.
    Resume {
        /// Id of the job.
        job_id: Uuid,
    },

    /// Cancel a job, queued or in flight.
    Cancel {
        /// Id of the job.
        job_id: Uuid,
    },

    /// Show the job queue, for one device or the whole farm.
    Queue {
        /// Limit to one device.
        device_id: Option<String>,
    },

    /// Stream every orchestrator event to stdout.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts: Opts = Opts::parse();

    let filter = if opts.debug {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("print_farm=debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("print_farm=info"))
    };
    if opts.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = FarmConfig::from_file(&opts.config)
        .with_context(|| format!("reading config {}", opts.config.display()))?;

    if let Err(err) = run_cmd(&opts, config).await {
        bail!("running cmd `{:?}` failed: {:?}", &opts.subcmd, err);
    }
    Ok(())
}

async fn run_cmd(opts: &Opts, config: FarmConfig) -> Result<()> {
    let orchestrator = Orchestrator::from_config(config)?;

    match &opts.subcmd {
        SubCommand::List => {
            for snapshot in orchestrator.all_statuses() {
                println!(
                    "{}\t{}\t{}\t{:?}",
                    snapshot.id, snapshot.transport, snapshot.name, snapshot.status
                );
            }
        }
        SubCommand::Status { device_id } => {
            let snapshot = orchestrator.status(device_id)?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        SubCommand::Connect { device_id } => {
            orchestrator.connect(device_id).await?;
            println!("{device_id}: connected");
        }
        SubCommand::Send { device_id, command } => {
            orchestrator.connect(device_id).await?;
            let response = orchestrator.send_command(device_id, command).await?;
            println!("{response}");
        }
        SubCommand::Print {
            device_id,
            file,
            priority,
        } => {
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .context("file name not found")?
                .to_owned();
            orchestrator.connect(device_id).await?;

            let mut events = orchestrator.subscribe();
            let job_id = orchestrator.submit_job(device_id, FileRef::path(name, file), *priority)?;
            println!("queued job {job_id}");

            // Follow the job until it settles.
            while let Ok(event) = events.recv().await {
                match event {
                    Event::JobStarted { job_id: id, .. } if id == job_id => {
                        println!("printing...");
                    }
                    Event::JobProgress {
                        job_id: id, progress, ..
                    } if id == job_id => {
                        println!("{progress:.1}%");
                    }
                    Event::JobCompleted { job_id: id, .. } if id == job_id => {
                        println!("done");
                        break;
                    }
                    Event::JobFailed {
                        job_id: id, message, ..
                    } if id == job_id => {
                        bail!("print failed: {message}");
                    }
                    Event::JobCancelled { job_id: id, .. } if id == job_id => {
                        bail!("print cancelled");
                    }
                    _ => {}
                }
            }
        }
        SubCommand::Pause { job_id } => {
            let job = orchestrator.pause_job(*job_id).await?;
            println!("{}: {}", job.id, job.status.label());
        }
        SubCommand::Resume { job_id } => {
            let job = orchestrator.resume_job(*job_id).await?;
            println!("{}: {}", job.id, job.status.label());
        }
        SubCommand::Cancel { job_id } => {
            let job = orchestrator.cancel_job(*job_id).await?;
            println!("{}: {}", job.id, job.status.label());
        }
        SubCommand::Queue { device_id } => {
            let jobs = match device_id {
                Some(id) => orchestrator.device_queue(id)?,
                None => orchestrator.queue(),
            };
            for job in jobs.iter().filter(|j| j.status != JobStatus::Completed) {
                println!(
                    "{}\t{}\t{}\tpriority {}\t{}",
                    job.id,
                    job.device_id,
                    job.status.label(),
                    job.priority,
                    job.file.name
                );
            }
        }
        SubCommand::Watch => {
            let mut events = orchestrator.subscribe();
            loop {
                match events.recv().await {
                    Ok(event) => println!("{}", serde_json::to_string(&event)?),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        eprintln!("lagged, missed {missed} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    Ok(())
}
