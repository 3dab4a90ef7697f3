//! Stagehand CLI - The `stagehand` command.
//!
//! Loads an orchestra file, starts a session on the built-in simulated
//! runtime and drives it while printing halts, faults, runtime messages
//! and rejected commands until the cycle count is reached or the process
//! is interrupted. Control state (breakpoints, sheets, MIDI bindings) can be
//! imported from and exported to TOML files.

mod driver;
mod settings;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use driver::{BreakSpec, RunOptions};
use stagehand_core::{ClockMode, EngineConfig, PerformanceEngine, SimRuntime, SynthRuntime};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Stagehand - live-performance control for synthesis code
#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Debugger and event sheets for a running synthesis session", long_about = None)]
struct Args {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an orchestra file
    Run {
        /// Orchestra (with optional score lines) to perform
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Control cycles to perform
        #[arg(short = 'n', long, default_value_t = 1000)]
        cycles: u64,

        /// Breakpoint as INSTR[:LINE][/SKIP]; may be repeated
        #[arg(short, long = "break", value_name = "SPEC")]
        breakpoints: Vec<BreakSpec>,

        /// Control state to import before running
        #[arg(long, value_name = "FILE")]
        state: Option<PathBuf>,

        /// Export the control state here when done
        #[arg(long, value_name = "FILE")]
        save_state: Option<PathBuf>,

        /// Start every sheet and the transport
        #[arg(long)]
        start_sheets: bool,

        /// Stop after this many halts (0 = always continue)
        #[arg(long, default_value_t = 0)]
        max_halts: usize,

        /// Override the configured clock
        #[arg(long, value_enum)]
        clock: Option<ClockArg>,

        /// Print playhead and channel changes too
        #[arg(short, long)]
        verbose: bool,
    },

    /// Compile an orchestra file and list its instruments
    Check {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Show or create the configuration file
    Config {
        /// Write a default configuration file
        #[arg(long)]
        init: bool,
    },

    /// Show version information
    Version,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ClockArg {
    Realtime,
    Free,
    Manual,
}

impl From<ClockArg> for ClockMode {
    fn from(clock: ClockArg) -> Self {
        match clock {
            ClockArg::Realtime => ClockMode::Realtime,
            ClockArg::Free => ClockMode::Free,
            ClockArg::Manual => ClockMode::Manual,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = match args.command {
        Commands::Config { init: true } => EngineConfig::default(),
        _ => settings::load_config(args.config.as_deref())?,
    };
    settings::init_logger(&config.log_level);

    match args.command {
        Commands::Run {
            file,
            cycles,
            breakpoints,
            state,
            save_state,
            start_sheets,
            max_halts,
            clock,
            verbose,
        } => {
            if let Some(clock) = clock {
                config.clock = clock.into();
            }
            let code = read_source(&file)?;
            let engine = PerformanceEngine::new(config);
            let interrupt = Arc::new(AtomicBool::new(false));
            for signal in signal_hook::consts::TERM_SIGNALS {
                signal_hook::flag::register(*signal, interrupt.clone())
                    .context("Failed to install signal handler")?;
            }
            let options = RunOptions {
                cycles,
                breakpoints,
                state,
                save_state,
                start_sheets,
                max_halts,
                verbose,
                interrupt: Some(interrupt),
            };
            let summary = driver::run(&engine, &code, &options)?;
            let ending = if summary.faulted {
                ", ended by fault"
            } else if summary.interrupted {
                ", interrupted"
            } else {
                ""
            };
            println!(
                "performed {} cycle(s), {} halt(s){}",
                summary.cycles, summary.halts, ending
            );
            if summary.faulted {
                anyhow::bail!("Session ended with a runtime fault");
            }
            Ok(())
        }
        Commands::Check { file } => {
            let code = read_source(&file)?;
            let mut runtime = SimRuntime::new(config.max_sample_rate);
            let program = runtime
                .compile(&code)
                .with_context(|| format!("Failed to compile {}", file.display()))?;
            println!(
                "{}: {} Hz, ksmps {}, {:.2} ms per cycle",
                file.display(),
                program.sample_rate,
                program.ksmps,
                program.cycle_duration() * 1000.0
            );
            println!("  nchnls {}", program.nchnls);
            for (number, len) in &program.tables {
                println!("  table {} ({} values)", number, len);
            }
            for info in program.instruments.values() {
                println!(
                    "  instr {} (lines {}-{}): statements at {:?}",
                    info.id, info.first_line, info.last_line, info.lines
                );
            }
            Ok(())
        }
        Commands::Config { init } => {
            let path = match args.config {
                Some(path) => path,
                None => settings::config_path()
                    .context("Could not determine the configuration directory")?,
            };
            if init {
                settings::write_default_config(&path)?;
                println!("wrote {}", path.display());
            } else {
                println!("{}", path.display());
                println!("{}", config.to_toml_string()?);
            }
            Ok(())
        }
        Commands::Version => {
            println!("stagehand {}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Crates:");
            println!("  - stagehand-core: engine, debugger, event sheets, channels");
            println!("  - stagehand-cli:  this command");
            Ok(())
        }
    }
}

fn read_source(file: &Path) -> Result<String> {
    if !file.exists() {
        anyhow::bail!("File not found: {}", file.display());
    }
    fs::read_to_string(file).with_context(|| format!("Failed to read file: {}", file.display()))
}
