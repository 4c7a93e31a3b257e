use std::path::PathBuf;
use std::process::{self, Command, Stdio};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::unbounded;
use log::info;

use mlpot_parity::engine::artifacts::{ArtifactCache, HttpFetcher};
use mlpot_parity::engine::driver::EvaluatorDriver;
use mlpot_parity::engine::evaluator::{EvaluatorFactory, ExecutionStrategy};
use mlpot_parity::engine::external::lammps::LammpsEvaluatorFactory;
use mlpot_parity::engine::reference::PairEvaluatorFactory;
use mlpot_parity::harness::config::{Backend, HarnessConfig};
use mlpot_parity::harness::runner::{MatrixReport, MatrixRunner, RunSettings};
use mlpot_parity::harness::HarnessEvent;

mod logging;

// --- CLI Definitions ---

#[derive(Parser, Debug)]
#[command(author, version, about = "Differential consistency harness for ML interatomic potentials", long_about = None)]
struct Args {
    /// JSON configuration file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Evaluator backend
    #[arg(short, long, value_enum)]
    backend: Option<Backend>,

    /// LAMMPS executable built with the symmetrix pair style
    #[arg(long)]
    lammps: Option<PathBuf>,

    /// Run LAMMPS with Kokkos (-k on -sf kk)
    #[arg(long)]
    kokkos: bool,

    /// Parameter file for the reference backend
    #[arg(long)]
    model: Option<PathBuf>,

    /// Directory holding downloaded model artifacts
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Number of worker threads for matrix cells
    #[arg(short, long)]
    threads: Option<usize>,

    /// Scenario to run (repeatable; default: all)
    #[arg(short, long = "scenario")]
    scenarios: Vec<String>,

    /// Execution strategy to run (repeatable; default: all)
    #[arg(long = "strategy")]
    strategies: Vec<ExecutionStrategy>,

    /// Skip the fresh re-run determinism check
    #[arg(long)]
    no_determinism: bool,

    /// Write one CSV row per check
    #[arg(long)]
    report_csv: Option<PathBuf>,

    /// Write the full report as JSON
    #[arg(long)]
    report_json: Option<PathBuf>,

    /// Also log to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only print the final verdict
    #[arg(short, long)]
    quiet: bool,
}

// --- Initialization Helpers ---

fn resolve_config(args: &Args) -> Result<HarnessConfig> {
    let mut config = match &args.config {
        Some(path) => HarnessConfig::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        None => HarnessConfig::default(),
    };

    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(exe) = &args.lammps {
        config.lammps.executable = exe.clone();
    }
    if args.kokkos {
        config.lammps.kokkos = true;
    }
    if let Some(model) = &args.model {
        config.model = Some(model.clone());
    }
    if let Some(dir) = &args.cache_dir {
        config.cache_dir = dir.clone();
    }
    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    if !args.scenarios.is_empty() {
        config.scenarios = args.scenarios.clone();
    }
    if !args.strategies.is_empty() {
        config.strategies = args.strategies.clone();
    }
    if args.no_determinism {
        config.determinism = false;
    }
    if args.report_csv.is_some() {
        config.report_csv = args.report_csv.clone();
    }
    if args.report_json.is_some() {
        config.report_json = args.report_json.clone();
    }
    if args.log_file.is_some() {
        config.log_file = args.log_file.clone();
    }

    config.validate()?;
    Ok(config)
}

fn check_dependencies(config: &HarnessConfig) -> Result<()> {
    if config.backend != Backend::Lammps {
        return Ok(());
    }
    // `-h` prints the help text and exits without reading an input script.
    match Command::new(&config.lammps.executable)
        .arg("-h")
        .stdin(Stdio::null())
        .output()
    {
        Ok(_) => Ok(()),
        Err(_) => Err(anyhow!(
            "Dependency Check Failed: '{}' executable not found.\n\
             The lammps backend needs a LAMMPS build with the symmetrix pair style.\n\
             Pass --lammps <path>, or use --backend reference.",
            config.lammps.executable.display()
        )),
    }
}

fn build_factory(config: &HarnessConfig) -> Arc<dyn EvaluatorFactory> {
    match config.backend {
        Backend::Lammps => Arc::new(LammpsEvaluatorFactory::new(
            &config.lammps.executable,
            config.lammps.kokkos,
        )),
        Backend::Reference => Arc::new(PairEvaluatorFactory),
    }
}

fn write_reports(config: &HarnessConfig, report: &MatrixReport) -> Result<()> {
    if let Some(path) = &config.report_csv {
        report
            .write_csv(path)
            .with_context(|| format!("Failed to write CSV report {}", path.display()))?;
        info!("CSV report written to {}", path.display());
    }
    if let Some(path) = &config.report_json {
        report
            .write_json(path)
            .with_context(|| format!("Failed to write JSON report {}", path.display()))?;
        info!("JSON report written to {}", path.display());
    }
    Ok(())
}

fn print_summary(report: &MatrixReport) {
    println!();
    println!("=== {} matrix ({}) ===", report.backend, report.run_id);
    for verdict in &report.scenarios {
        let mark = if verdict.consistent { "OK  " } else { "FAIL" };
        println!("[{}] {}", mark, verdict.name);
        for cell in report.cells.iter().filter(|c| c.scenario == verdict.name) {
            println!(
                "       {:<24} {:>2}/{:<2} checks  {:?}",
                cell.strategy.as_str(),
                cell.checks.passed_count(),
                cell.checks.total_count(),
                cell.status
            );
            for check in cell.checks.failures() {
                println!("         {}", check);
            }
        }
        for check in verdict.invariance.failures() {
            println!("       {}", check);
        }
    }
}

// --- Main ---

fn main() -> Result<()> {
    // 1. Parsing
    let args = Args::parse();
    let config = resolve_config(&args)?;
    logging::setup_logging(args.verbose, args.quiet, config.log_file.as_deref())?;

    // 2. Pre-flight Checks
    if let Err(e) = check_dependencies(&config) {
        eprintln!("{}", e);
        process::exit(2);
    }

    // 3. Scenarios & Evaluator
    let scenarios = config.select_scenarios()?;
    let fetcher = HttpFetcher::new(config.download.timeout())?;
    let cache = ArtifactCache::new(
        &config.cache_dir,
        Arc::new(fetcher),
        config.download.retry_policy(),
    );
    let driver = Arc::new(EvaluatorDriver::new(build_factory(&config), Arc::new(cache)));

    // 4. Progress Reporter
    let (tx, rx) = unbounded();
    let quiet = args.quiet;
    let reporter = thread::Builder::new()
        .name("Progress".to_string())
        .spawn(move || {
            for event in rx {
                match event {
                    HarnessEvent::CellStarted { scenario, strategy } => {
                        info!("Started {}/{}", scenario, strategy);
                    }
                    HarnessEvent::CellFinished(stats) => {
                        if !quiet {
                            eprintln!(
                                "{:<16} {:<24} {} ({}/{} checks, {} ms){}",
                                stats.scenario,
                                stats.strategy.as_str(),
                                if stats.passed { "pass" } else { "FAIL" },
                                stats.checks_passed,
                                stats.checks_total,
                                stats.elapsed_ms,
                                stats.error.map(|e| format!(": {}", e)).unwrap_or_default()
                            );
                        }
                    }
                    HarnessEvent::Log(msg) => info!("{}", msg),
                    HarnessEvent::Finished { .. } => break,
                }
            }
        })?;

    // 5. Matrix
    let settings = RunSettings {
        threads: config.threads,
        determinism: config.determinism,
    };
    let runner = MatrixRunner::new(driver, settings).with_events(tx);
    let report = runner.run(&scenarios, &config.strategies)?;
    drop(runner);
    let _ = reporter.join();

    // 6. Reports & Exit Code
    write_reports(&config, &report)?;
    if !args.quiet {
        print_summary(&report);
    }
    let consistent = report.all_consistent();
    println!(
        "{}",
        if consistent { "All scenarios consistent." } else { "Inconsistencies found." }
    );
    process::exit(if consistent { 0 } else { 1 });
}
