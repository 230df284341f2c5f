// SPDX-License-Identifier: AGPL-3.0-only

//! `sbr`: PCIe secondary bus reset link retrain tester.
//!
//! ```text
//! USAGE:
//!   sbr slots                                  List slots and their bridges
//!   sbr run --loops N --slot S [--slot S ..]   Retrain the slots N times
//!       [--abort y|n] [--output FILE] [--train-time SECS] [--inventory]
//!
//!   --backend setpci|sysfs|sim                 Register access (default setpci)
//!   SBR_PASSWORD / --password-stdin            sudo password for writes
//! ```

mod progress;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use progress::ConsoleSink;
use sbr_driver::{
    inventory, select_backend, AbortPolicy, BackendSelection, Clock, Credential, EngineState,
    FixedProbe, ManualClock, PollingProbe, RegisterAccess, RetrainSession, SlotDiscovery,
    SystemClock, TestConfig, TrainTimeProbe, MAX_LOOPS,
};
use std::io::{BufRead, IsTerminal};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sbr", about = "PCIe link retrain tester", version)]
struct Cli {
    /// Register access backend (setpci, sysfs, sim).
    #[arg(long, global = true, default_value = "setpci")]
    backend: BackendSelection,

    /// More log output (-v info, -vv debug).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List slot numbers and the bridges they sit behind.
    Slots,
    /// Retrain the selected slots and check every link comes back.
    Run(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Number of retrain loops per slot.
    #[arg(
        short,
        long,
        value_parser = clap::value_parser!(u32).range(..=i64::from(MAX_LOOPS))
    )]
    loops: u32,

    /// Stop at the first link mismatch (y) or log it and continue (n).
    #[arg(short, long, default_value = "n")]
    abort: AbortPolicy,

    /// Slot number to test; repeat or comma-separate for several.
    #[arg(short, long = "slot", required = true, value_delimiter = ',')]
    slots: Vec<u16>,

    /// Run log file.
    #[arg(short, long, default_value = "output.txt")]
    output: PathBuf,

    /// Fixed train time in seconds instead of measuring each slot.
    #[arg(long)]
    train_time: Option<f64>,

    /// Record `dmidecode -t 1` in the run log.
    #[arg(long)]
    inventory: bool,

    /// Read the sudo password from the first line of stdin.
    #[arg(long)]
    password_stdin: bool,

    #[arg(long, env = "SBR_PASSWORD", hide = true, hide_env_values = true)]
    password: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let access = select_backend(cli.backend);

    match cli.command {
        Cmd::Slots => cmd_slots(access.as_ref())?,
        Cmd::Run(args) => cmd_run(access.as_ref(), cli.backend, args)?,
    }

    Ok(())
}

fn cmd_slots(access: &dyn RegisterAccess) -> Result<()> {
    let table = SlotDiscovery::new(access).discover()?;

    println!("Available slot numbers:");
    for record in table.records() {
        println!("{} : {}", record.slot, record.upstream);
    }
    if table.is_empty() {
        println!("  (none found via {})", access.backend_name());
    }

    Ok(())
}

fn cmd_run(access: &dyn RegisterAccess, backend: BackendSelection, args: RunArgs) -> Result<()> {
    let credential = read_credential(&args)?;
    let config = TestConfig::new(args.slots.clone(), args.loops)
        .with_abort_policy(args.abort)
        .with_credential(credential);
    tracing::debug!("Credential supplied: {}", config.credential.is_present());

    // The simulated topology retrains instantly; don't sleep for it
    let system_clock = SystemClock;
    let manual_clock = ManualClock::new();
    let clock: &dyn Clock = if backend == BackendSelection::Simulated {
        &manual_clock
    } else {
        &system_clock
    };

    let fixed;
    let polling;
    let probe: &dyn TrainTimeProbe = match args.train_time {
        Some(secs) => {
            if !secs.is_finite() || secs < 0.0 {
                bail!("--train-time must be a non-negative number of seconds, got {secs}");
            }
            fixed = FixedProbe::from_secs_f64(secs);
            &fixed
        }
        None => {
            polling = PollingProbe::new(access, clock, &config.credential);
            &polling
        }
    };

    let preamble = if args.inventory {
        inventory::system_inventory(&config.credential)
    } else {
        Vec::new()
    };

    let mut sink = ConsoleSink::new(&args.output, std::io::stderr().is_terminal());

    eprintln!(
        "Running {} loop(s) on slot(s) {:?} via {}",
        config.loops,
        config.slots,
        access.backend_name()
    );

    let report = RetrainSession::new(access, clock)
        .with_preamble(preamble)
        .run_test(&config, probe, &mut sink)
        .with_context(|| format!("Run failed; partial log in {}", sink.path().display()))?;

    match &report.state {
        EngineState::Completed => eprintln!(
            "Test completed: {} check(s), {} mismatch(es), {} write and {} read failure(s).",
            report.checks,
            report.mismatches.len(),
            report.write_failures,
            report.read_failures
        ),
        EngineState::Aborted(reason) => eprintln!("Test aborted: {reason}."),
        EngineState::Idle | EngineState::Running => {}
    }
    eprintln!("Check {} for results.", sink.path().display());

    report.ensure_passed()?;
    Ok(())
}

fn read_credential(args: &RunArgs) -> Result<Credential> {
    if args.password_stdin {
        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("reading password from stdin")?;
        return Ok(Credential::password(line.trim_end_matches(['\r', '\n'])));
    }

    Ok(args
        .password
        .as_deref()
        .map_or_else(Credential::none, Credential::password))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_arguments_parse() {
        let cli = Cli::try_parse_from([
            "sbr", "--backend", "sim", "run", "--loops", "5", "--abort", "y", "--slot", "3",
            "--slot", "5,7",
        ])
        .unwrap();

        assert_eq!(cli.backend, BackendSelection::Simulated);
        let Cmd::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.loops, 5);
        assert_eq!(args.abort, AbortPolicy::AbortOnMismatch);
        assert_eq!(args.slots, vec![3, 5, 7]);
        assert_eq!(args.output, PathBuf::from("output.txt"));
    }

    #[test]
    fn run_requires_a_slot() {
        assert!(Cli::try_parse_from(["sbr", "run", "--loops", "1"]).is_err());
        assert!(
            Cli::try_parse_from(["sbr", "run", "--loops", "1", "--abort", "maybe", "-s", "3"])
                .is_err()
        );
    }

    #[test]
    fn loop_count_is_bounded() {
        let max = MAX_LOOPS.to_string();
        let over = (u64::from(MAX_LOOPS) + 1).to_string();

        assert!(Cli::try_parse_from(["sbr", "run", "-l", max.as_str(), "-s", "3"]).is_ok());
        assert!(Cli::try_parse_from(["sbr", "run", "-l", over.as_str(), "-s", "3"]).is_err());
        assert!(Cli::try_parse_from(["sbr", "run", "-l", "4294967295", "-s", "3"]).is_err());
    }

    #[test]
    fn simulated_run_writes_log() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("output.txt");
        let cli = Cli::try_parse_from([
            "sbr",
            "--backend",
            "sim",
            "run",
            "-l",
            "2",
            "-s",
            "3",
            "--train-time",
            "0.5",
            "-o",
            output.to_str().unwrap(),
        ])
        .unwrap();
        let Cmd::Run(args) = cli.command else {
            panic!("expected run");
        };

        let access = select_backend(BackendSelection::Simulated);
        cmd_run(access.as_ref(), BackendSelection::Simulated, args).unwrap();

        let log = std::fs::read_to_string(&output).unwrap();
        assert!(log.contains("Train Time: 0.5s"));
        assert!(log.contains("Summary: loops=2 iterations=5 slots=1 checks=3 mismatches=0"));
    }
}
