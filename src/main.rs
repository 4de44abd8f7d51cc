//! archdisk - entry point
//!
//! Owns the outer failure boundary: any error after the plan exists triggers a
//! best-effort unmount before the process exits non-zero (130 on interrupt).

use anyhow::{Context, Result};
use std::path::Path;
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use archdisk::cli::{Cli, Commands};
use archdisk::command_runner::SystemRunner;
use archdisk::disk::{inspect_disk, list_disks};
use archdisk::engine::{ask_passphrase, AutoPlanner, ManualPlanner, PartitioningPlan, PlannerOutcome};
use archdisk::hardware::detect_firmware_mode;
use archdisk::process_guard::{self, SessionGuard};
use archdisk::prompt::ConsolePrompter;
use archdisk::session::{InstallSession, PreLaunch};
use archdisk::types::PlanningMode;
use archdisk::{sanity, LayoutError};

/// Initialize the logger: `LEVEL file:line message` on stderr, `info` unless RUST_LOG says otherwise
fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .without_time()
        .init();
}

fn main() -> ExitCode {
    init_logger();
    info!("archdisk starting up");

    if let Err(e) = process_guard::install_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    let _guard = SessionGuard::new();

    let cli = Cli::parse_args();
    debug!("CLI arguments parsed");

    if cli.is_destructive() && !cli.dry_run {
        if let Err(report) = sanity::run_preflight_checks(cli.skip_root_check) {
            eprintln!("{}", report);
            return ExitCode::from(1);
        }
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            if process_guard::interrupted() {
                ExitCode::from(130)
            } else {
                ExitCode::from(1)
            }
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let runner = SystemRunner::new(cli.dry_run);

    match &cli.command {
        Commands::Inspect { disk: Some(disk) } => {
            let disk = inspect_disk(&runner, disk)?;
            print!("{}", disk);
            Ok(())
        }
        Commands::Inspect { disk: None } => {
            for disk in list_disks(&runner)? {
                println!("{}", disk);
            }
            Ok(())
        }
        Commands::Plan { manual, disk, save } => {
            let mode = if *manual {
                PlanningMode::Manual
            } else {
                PlanningMode::Automatic
            };
            run_plan(&runner, &cli.target, mode, disk.as_deref(), save.as_deref())
        }
        Commands::Apply { session } => {
            let session = load_valid_session(session)?;
            let mut plan = session.partitioning;
            if plan.needs_passphrase() {
                plan.set_passphrase(Some(ask_passphrase(&ConsolePrompter)?));
            }
            format_and_mount(&runner, &mut plan)
        }
        Commands::Umount { session } => {
            let session = InstallSession::load_from_file(session)?;
            session.partitioning.umount_partitions(&runner)?;
            println!("All partitions of the session are unmounted");
            Ok(())
        }
        Commands::Validate { session } => {
            info!("Validating session file: {:?}", session);
            load_valid_session(session)?;
            println!("Session file is valid: {}", session.display());
            Ok(())
        }
    }
}

fn load_valid_session(path: &Path) -> Result<InstallSession> {
    let session = InstallSession::load_from_file(path)?;
    session
        .validate()
        .with_context(|| format!("Session {:?} failed validation", path))?;
    Ok(session)
}

/// Run the planners until one yields a plan, switching modes on request.
fn run_plan(
    runner: &SystemRunner,
    target: &Path,
    mut mode: PlanningMode,
    disk: Option<&Path>,
    save: Option<&Path>,
) -> Result<()> {
    let firmware = detect_firmware_mode();
    let prompter = ConsolePrompter;

    let mut plan = loop {
        info!("{} partitioning on {} firmware", mode, firmware);
        let outcome = match mode {
            PlanningMode::Automatic => {
                AutoPlanner::new(runner, &prompter, firmware, target).run(disk)
            }
            PlanningMode::Manual => {
                ManualPlanner::new(runner, &prompter, firmware, target).run(disk)
            }
        };
        match outcome {
            Ok(PlannerOutcome::Accepted(plan)) => break plan,
            Ok(PlannerOutcome::SwitchMode) => mode = mode.switched(),
            // Nothing is mounted yet; a written partition table is left as is.
            Err(e) => return Err(e).context("Planning failed"),
        }
    };

    let save_session = |plan: &PartitioningPlan| -> Result<()> {
        if let Some(path) = save {
            InstallSession::new(PreLaunch::new(firmware, mode), plan.clone()).save_to_file(path)?;
            info!("Session saved to {:?}", path);
        }
        Ok(())
    };

    save_session(&plan)?;
    format_and_mount(runner, &mut plan)?;
    save_session(&plan)
}

/// Format and mount, unmounting everything on any failure.
fn format_and_mount(runner: &SystemRunner, plan: &mut PartitioningPlan) -> Result<()> {
    if let Err(e) = plan.format_and_mount_partitions(runner) {
        cleanup(runner, plan);
        return Err(e.into());
    }
    if process_guard::interrupted() {
        cleanup(runner, plan);
        return Err(LayoutError::Interrupted.into());
    }
    println!("{}", plan.summary());
    println!("Mounted under {}", plan.target_root().display());
    Ok(())
}

fn cleanup(runner: &SystemRunner, plan: &PartitioningPlan) {
    warn!("Unmounting everything under {}", plan.target_root().display());
    let cleanup_runner = runner.for_cleanup();
    if let Err(e) = plan.umount_partitions(&cleanup_runner) {
        warn!("Cleanup did not finish: {}", e);
    }
}

