use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use submit_batch::help::help_text;
use submit_batch::purge::purge;
use submit_batch::{
    kill_run, KillReport, LaunchEnv, MergeMode, MergeReport, Orchestrator, PipelineVariant,
    RunConfig, RunOptions, RunOutcome, RunSnapshot, SubmitError,
};

#[derive(Parser)]
#[command(name = "submit_batch")]
#[command(about = "Submit simulation, light-curve fit and BBC jobs, then merge their results", long_about = None)]
struct Cli {
    /// Input file (YAML with a CONFIG block, or a legacy input). Merge and
    /// kill also accept the run's output directory or its SUBMIT.INFO.
    input_file: Option<PathBuf>,

    /// Print the help menu for one program class and exit
    #[arg(short = 'H', long = "HELP", value_name = "SIM|FIT|BBC")]
    help_class: Option<String>,

    /// Prepare the output area and scripts, but do not submit
    #[arg(short = 'n', long)]
    nosubmit: bool,

    /// Reduce every task by a factor of 10
    #[arg(long)]
    fast: bool,

    /// Remove stale generated files under the current directory and exit
    #[arg(long)]
    purge: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Kill the run described by the input file
    #[arg(short, long)]
    kill: bool,

    /// Replace an existing output directory
    #[arg(long)]
    overwrite: bool,

    /// Submit without merge triggers
    #[arg(long)]
    nomerge: bool,

    /// Rebuild MERGE.LOG from SUBMIT.INFO and merge again
    #[arg(long = "merge_reset")]
    merge_reset: bool,

    /// Single merge pass (invoked by the job scripts)
    #[arg(short = 'm', long)]
    merge: bool,

    /// Repeat merge passes until the run is done
    #[arg(short = 'M', long = "MERGE")]
    full_merge: bool,

    /// Run token of the submission that wrote the calling script
    #[arg(short = 't', value_name = "TOKEN", hide = true)]
    token: Option<i64>,

    /// Worker slot of the calling script
    #[arg(long, hide = true)]
    cpunum: Option<u32>,
}

impl Cli {
    fn merge_mode(&self) -> MergeMode {
        if self.merge_reset {
            MergeMode::Reset
        } else if self.full_merge {
            MergeMode::Full
        } else if self.merge {
            MergeMode::Single
        } else {
            MergeMode::None
        }
    }

    fn options(&self) -> RunOptions {
        RunOptions {
            nosubmit: self.nosubmit,
            fast: self.fast,
            nomerge: self.nomerge,
            overwrite: self.overwrite,
            kill: self.kill,
            merge: self.merge_mode(),
            run_token: self.token,
            cpunum: self.cpunum,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "submit_batch=debug"
    } else {
        "submit_batch=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = exit_code(&err);
            if code == 3 {
                tracing::error!("{:#}", err);
            }
            eprintln!("ERROR: {:#}", err);
            ExitCode::from(code)
        }
    }
}

/// 1: unusable input, 2: I/O or backend failure, 3: ledger state conflict
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<SubmitError>() {
        Some(SubmitError::InvalidTransition { .. }) => 3,
        Some(e) if e.is_input_error() => 1,
        Some(_) | None => 2,
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Some(tag) = &cli.help_class {
        let variant = PipelineVariant::from_tag(tag)
            .ok_or_else(|| SubmitError::InvalidConfig(format!("unknown program class '{}' (use SIM, FIT or BBC)", tag)))?;
        println!("{}", help_text(variant));
        return Ok(());
    }

    let launch_dir = std::env::current_dir().context("Failed to read the current directory")?;

    if cli.purge {
        let report = purge(&launch_dir);
        println!(
            "Purged {} entries under {:?} ({} could not be removed)",
            report.removed.len(),
            launch_dir,
            report.failed.len()
        );
        return Ok(());
    }

    let input_file = cli.input_file.clone().ok_or_else(|| {
        SubmitError::InvalidConfig("an input file is required".to_string())
    })?;

    let env = LaunchEnv {
        launch_dir,
        data_root: std::env::var_os("SNDATA_ROOT").map(PathBuf::from),
        exe: std::env::current_exe().context("Failed to locate the submit_batch executable")?,
    };

    let options = cli.options();
    if options.kill || options.merge.is_merge() {
        return run_existing(&input_file, options, env).await;
    }

    let config = load_config(&input_file, options, env)?;
    let orch = Orchestrator::new(&config)?;
    print_run(&orch, &orch.run().await?);
    Ok(())
}

/// Kill or merge a submitted run, using only what its snapshot froze
async fn run_existing(target: &Path, options: RunOptions, env: LaunchEnv) -> Result<()> {
    let output_dir =
        RunSnapshot::locate(target, &env, &options).map_err(|e| as_input_error(target, e))?;
    let snapshot = match RunSnapshot::load(&output_dir).await {
        Ok(snapshot) => snapshot,
        Err(SubmitError::SnapshotMissing { .. }) if options.kill => {
            println!("Nothing to kill.");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let config = RunConfig::from_snapshot(&snapshot, options, env);
    let orch = Orchestrator::for_output_dir(&config, output_dir);

    if config.options.kill {
        match kill_run(&orch).await? {
            KillReport::NothingToKill => println!("Nothing to kill."),
            KillReport::Killed {
                killed,
                cancel_failures,
                ..
            } => {
                println!("Killed {} task(s).", killed.len());
                if !cancel_failures.is_empty() {
                    println!(
                        "Could not cancel {} worker slot(s); check them by hand.",
                        cancel_failures.len()
                    );
                }
            }
        }
        return Ok(());
    }

    match config.options.merge {
        MergeMode::Reset => print_merge(&orch.merge_reset().await?),
        MergeMode::Full => print_merge(&orch.full_merge().await?),
        MergeMode::Single | MergeMode::None => print_merge(&orch.merge_pass().await?),
    }
    Ok(())
}

fn load_config(path: &Path, options: RunOptions, env: LaunchEnv) -> Result<RunConfig> {
    let config = RunConfig::load(path, options, env).map_err(|e| as_input_error(path, e))?;
    Ok(config)
}

/// Input problems all exit with the input-error code
fn as_input_error(path: &Path, err: SubmitError) -> SubmitError {
    match err {
        SubmitError::Io(io) => SubmitError::InvalidConfig(format!("cannot read {:?}: {}", path, io)),
        SubmitError::Yaml(y) => SubmitError::InvalidConfig(format!("{:?} is not valid YAML: {}", path, y)),
        other => other,
    }
}

fn print_merge(report: &MergeReport) {
    match report {
        MergeReport::Abandoned { reason } => println!("Merge pass skipped: {}", reason),
        MergeReport::Stalled { reason, doc } => {
            println!("{} [{}] {}", doc.run_id, doc.state, doc.counts());
            println!("Merge stopped: {}", reason);
        }
        MergeReport::NoOp(doc) | MergeReport::Advanced { doc, .. } => {
            println!("{} [{}] {}", doc.run_id, doc.state, doc.counts());
            if let Some(outcome) = doc.outcome {
                println!("Run finished: {} ({} failed task(s))", outcome, doc.failure_count);
            }
        }
    }
}

fn print_run(orch: &Orchestrator<'_>, outcome: &RunOutcome) {
    let layout = orch.layout();
    let options = &orch.config().options;

    match outcome {
        RunOutcome::DryRun(prepared) => {
            println!(
                "Prepared {} task(s) in {} script(s); nothing submitted.",
                prepared.snapshot.tasks.len(),
                prepared.batches.len()
            );
            println!("Inspect the jobs in {:?}", layout.script_dir);
        }
        RunOutcome::Submitted { report, merge, .. } => {
            println!(
                "Submitted {} task(s) on {} worker slot(s).",
                report.n_tasks,
                report.accepted_slots.len()
            );
            for err in &report.rejected {
                println!("  {}", err);
            }
            if let Some(merge) = merge {
                print_merge(merge);
            }
            println!("Check status in {:?}", layout.output_dir.join(submit_batch::ledger::LEDGER_FILE));
            if options.nomerge {
                println!("Merge triggers are off (--nomerge); run with -M to merge by hand.");
            }
            if options.fast {
                println!("REMEMBER: fast mode, every task ran at 1/10 of its size.");
            }
        }
    }
}
