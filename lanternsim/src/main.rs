//! Lantern device simulator
//!
//! Usage: `lanternsim <config.json>`

use std::env;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info};

use lanternlib::{load_config, TransportContext};
use lanternsim::Simulator;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <config.json>", args[0]);
        process::exit(1);
    }

    let config = match load_config(&args[1]) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration {}: {}", args[1], e);
            process::exit(1);
        }
    };

    info!("Lantern simulator starting up, system id {}", config.general.system_id);

    let context = TransportContext::new();
    let mut simulator = match Simulator::new(&config, &context) {
        Ok(simulator) => simulator,
        Err(e) => {
            eprintln!("Failed to start simulator: {}", e);
            process::exit(1);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        eprintln!("Error setting Ctrl+C handler: {}", e);
        process::exit(1);
    }

    let result = simulator.run(running);
    context.terminate();
    if let Err(e) = result {
        error!("Simulator error: {}", e);
        process::exit(1);
    }

    info!("Lantern simulator shutdown complete");
}
