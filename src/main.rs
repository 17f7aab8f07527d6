use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod bridge;
mod capture;
mod config;
mod console;
mod error;
mod presence;
mod protocol;
mod sensor;
#[cfg(test)]
mod testing;
mod upload;

use capture::Orchestrator;
use config::Config;
use console::{Command, Console};
use presence::SystemClock;
use sensor::{open_port, Sensor};
use upload::HttpUploader;

#[derive(Parser)]
#[command(name = "fingerprint_relay")]
#[command(about = "Fingerprint relay\n\nCaptures images from a UART fingerprint sensor and streams them to an HTTP server.", long_about = None)]
struct Cli {
    /// Path to configuration file (JSON)
    config: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Enable detailed debug (hex dumps of every sensor packet)
    #[arg(long)]
    ddebug: bool,
}

fn init_logging(cli: &Cli) {
    let level = if cli.ddebug {
        "trace"
    } else if cli.debug {
        "debug"
    } else {
        "info"
    };

    // RUST_LOG wins over the command line flags
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    // Load configuration
    let config_data = fs::read_to_string(&cli.config)
        .with_context(|| format!("failed to read config file {}", cli.config))?;
    let config: Config = serde_json::from_str(&config_data)
        .with_context(|| format!("failed to parse config file {}", cli.config))?;

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    if let Err(e) = ctrlc::set_handler(move || {
        handler_flag.store(false, Ordering::Relaxed);
    }) {
        warn!("Could not set Ctrl-C handler: {}", e);
    }

    let port = open_port(&config.sensor)?;
    let mut sensor = Sensor::new(port, config.sensor.address, config.sensor.read_timeout());
    match sensor.verify_password(config.sensor.password) {
        Ok(true) => info!("Sensor password accepted"),
        Ok(false) => bail!("sensor rejected the configured password"),
        Err(e) => bail!("sensor did not answer the password check: {}", e),
    }

    let uploader = HttpUploader::new(&config.server);
    let mut orchestrator = Orchestrator::new(sensor, uploader, SystemClock, &config);
    let mut console = Console::spawn(Arc::clone(&running));

    println!("Commands: detect | cls | stop | quit");
    loop {
        print!(">> ");
        io::stdout().flush().ok();

        let Some(line) = console.read_line() else { break };
        let Some(command) = Command::parse(&line) else { continue };

        let outcome = match command {
            Command::Detect => {
                let Some(subject_id) = console.prompt_subject_id() else { break };
                orchestrator.run_detect(subject_id, &mut console)
            }
            Command::Classify => orchestrator.run_classify(&mut console),
            Command::Stop => {
                println!("No running mode to stop.");
                continue;
            }
            Command::Quit => break,
            Command::Unknown(word) => {
                println!("Unknown command: {}", word);
                continue;
            }
        };

        if outcome.ends_process() {
            break;
        }
    }

    println!("Bye!");
    Ok(())
}
