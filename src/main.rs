use std::path::PathBuf;

use cartracker::format::{format_distance, format_duration, format_speed, speed_category};
use cartracker::replay::{self, ReplaySummary};
use cartracker::{InMemoryTripStore, TrackerConfig, TrackerError, TripTracker};
use clap::{Parser, Subcommand};
use log::warn;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a file of recorded fixes through the trip tracker
    Replay {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Close a trip still open after the last fix
        #[arg(long, default_value_t = false)]
        close_open_trip: bool,
    },
    /// Print the effective configuration
    Config {
        #[arg(short, long, default_value_t = false)]
        save: bool,
    },
}

/// An explicit path has to load, the local file is optional
fn load_config(path: Option<&PathBuf>) -> Result<TrackerConfig, TrackerError> {
    match path {
        Some(path) => TrackerConfig::from_path(path),
        None => {
            let config = TrackerConfig::from_local_file()
                .unwrap_or_else(|e| {
                    warn!("Ignoring local config file: {}", e);
                    None
                })
                .unwrap_or_default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn run_replay(
    input: &PathBuf,
    output: Option<&PathBuf>,
    config: Option<&PathBuf>,
    close_open_trip: bool,
) -> Result<(), TrackerError> {
    let config = load_config(config)?;
    let fixes = replay::load_fixes(input)?;

    let mut tracker = TripTracker::new(&config);
    let mut store = InMemoryTripStore::new();
    let summary = replay::replay_fixes(&mut tracker, &mut store, &fixes, close_open_trip);

    if let Some(output_file) = output {
        replay::write_events(output_file, &summary.events)?;
    }
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &ReplaySummary) {
    println!(
        "{} fixes: {} accepted, {} rejected",
        summary.fixes, summary.accepted, summary.rejected
    );
    if summary.allocation_failures > 0 || summary.store_failures > 0 {
        println!(
            "{} trip starts failed, {} store writes failed",
            summary.allocation_failures, summary.store_failures
        );
    }

    for trip in summary.completed_trips() {
        println!(
            "Trip #{}: {} in {}, max {} ({}), avg {}, {} points",
            trip.id,
            format_distance(trip.distance_m),
            format_duration(trip.duration_ms),
            format_speed(trip.max_speed_kmh),
            speed_category(trip.max_speed_kmh),
            format_speed(trip.avg_speed_kmh),
            trip.point_count
        );
    }
    if let Some(trip) = &summary.open_trip {
        println!(
            "Trip #{} still open: {} in {}, {} points",
            trip.id,
            format_distance(trip.distance_m),
            format_duration(trip.duration_ms),
            trip.point_count
        );
    }
}

fn show_config(save: bool) -> Result<(), TrackerError> {
    let config = load_config(None)?;
    let pretty = serde_json::to_string_pretty(&config)
        .map_err(|e| TrackerError::ConfigSerializeError { source: e })?;
    println!("{}", pretty);

    if save {
        config.save()?;
        if let Some(path) = TrackerConfig::default_path() {
            println!("Saved to {:?}", path);
        }
    }
    Ok(())
}

fn main() {
    #[cfg(debug_assertions)]
    colog::init();

    let cli = Args::parse();
    ctrlc::set_handler(move || {
        println!("Exiting...");
        std::process::exit(0);
    })
    .expect("Could not set Ctrl-C handler");
    match &cli.command {
        Commands::Replay {
            input,
            output,
            config,
            close_open_trip,
        } => {
            run_replay(input, output.as_ref(), config.as_ref(), *close_open_trip)
                .expect("Error while replaying fixes");
        }
        Commands::Config { save } => {
            show_config(*save).expect("Error while reading configuration");
        }
    };
}
