// src/main.rs
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

use unit_tracker::config::{load_config, Config};
use unit_tracker::session::directory::DirectoryStore;
use unit_tracker::session::synthetic::SyntheticSessions;
use unit_tracker::session::SessionStore;
use unit_tracker::utils::log::init_logging;
use unit_tracker::{MultiSessionTracker, TrackingResult};

#[derive(Parser, Debug)]
#[command(
    name = "unit-tracker",
    version,
    about = "Track spike-sorted units across recording sessions",
    long_about = None
)]
struct Args {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` overrides it.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Track units across the sessions stored under a directory.
    Track {
        /// Directory holding one sub-directory per session.
        #[arg(short, long, value_name = "DIR")]
        data_dir: PathBuf,

        /// YAML configuration file. Defaults are used when omitted.
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Override the output directory from the config.
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,

        /// Compare session pairs in parallel.
        #[arg(long, default_value_t = false)]
        parallel: bool,
    },
    /// Generate synthetic sessions and track them.
    Demo {
        /// Where the synthetic sessions and results are written.
        #[arg(short, long, value_name = "DIR")]
        output: PathBuf,

        #[arg(long, default_value_t = 4)]
        sessions: usize,

        #[arg(long, default_value_t = 5)]
        units: usize,

        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

fn main() {
    let args = Args::parse();
    init_logging(&args.log_level);
    info!("unit-tracker v{}", unit_tracker::VERSION);

    let result = match args.command {
        Command::Track {
            data_dir,
            config,
            output,
            parallel,
        } => track(data_dir, config, output, parallel),
        Command::Demo {
            output,
            sessions,
            units,
            seed,
        } => demo(output, sessions, units, seed),
    };

    if let Err(e) = result {
        error!("{}", e);
        eprintln!("{} {}", "error:".red().bold(), e);
        process::exit(1);
    }
}

fn track(
    data_dir: PathBuf,
    config_path: Option<PathBuf>,
    output: Option<PathBuf>,
    parallel: bool,
) -> TrackingResult<()> {
    let mut config = match config_path {
        Some(path) => {
            info!("loading configuration from {}", path.display());
            load_config(&path)?
        }
        None => Config::default(),
    };
    if let Some(dir) = output {
        config.output.dir = dir;
    }
    if parallel {
        config.tracker.parallel = true;
    }
    config.validate()?;

    let store = DirectoryStore::new(&data_dir);
    run_tracker(&store, &config)
}

fn demo(dir: PathBuf, sessions: usize, units: usize, seed: u64) -> TrackingResult<()> {
    let synthetic = SyntheticSessions {
        num_sessions: sessions,
        units_per_group: units,
        seed,
        ..SyntheticSessions::default()
    };
    let data_dir = dir.join("sessions");
    let store = DirectoryStore::new(&data_dir);
    synthetic.write_to(&store)?;
    info!(
        "wrote {} synthetic sessions to {}",
        sessions,
        data_dir.display()
    );

    let mut config = Config::default();
    config.output.dir = dir.join("tracking-output");
    config.pruning.max_depth_delta_um = Some(100.0);
    run_tracker(&store, &config)
}

fn run_tracker(store: &dyn SessionStore, config: &Config) -> TrackingResult<()> {
    let mut tracker = MultiSessionTracker::new(store, config.tracker.clone())?
        .with_data_path(&config.output.dir);
    tracker.run(&config.pruning)?;
    tracker.save_outputs(&config.output)?;

    for (channel_group, units) in tracker.identified_units() {
        let tracked = units.iter().filter(|u| u.session_count() > 1).count();
        println!(
            "{} {}: {} units, {} tracked across sessions",
            "channel group".bold(),
            channel_group,
            units.len(),
            tracked.to_string().green()
        );
        for unit in units.iter().filter(|u| u.session_count() > 1) {
            let members: Vec<String> = unit
                .original_unit_ids
                .iter()
                .map(|(session, ids)| format!("{}:{:?}", session, ids))
                .collect();
            println!(
                "  {} {:.4} {}",
                unit.id.to_string().cyan(),
                unit.average_dissimilarity.unwrap_or(0.0),
                members.join(" ")
            );
        }
    }
    println!(
        "{} {}",
        "results written to".green(),
        config.output.dir.display()
    );
    Ok(())
}
