//! aserver - audio bridge server binary
//!
//! Loads settings, applies command line overrides, and serves the audio
//! socket until Ctrl-C or SIGTERM.

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;

use clap::Parser;

use aserver::{AudioOptions, AudioServer, ServerSettings};

#[derive(Parser)]
#[command(name = "aserver")]
#[command(version)]
#[command(about = "Bridges a sandboxed guest's audio stream to the host output device")]
struct Cli {
    /// Socket path the guest connects to
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Settings file to use instead of the default location
    #[arg(long)]
    config: Option<PathBuf>,

    /// Audio options as key=value pairs (latencyMillis, performanceMode, volume)
    #[arg(long)]
    options: Option<String>,

    /// Never offer shared memory; audio travels inline on the socket
    #[arg(long)]
    no_shm: bool,

    /// Serve every connection on the event loop thread
    #[arg(long)]
    single_threaded: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Print the guest environment variables and exit
    #[arg(long)]
    print_env: bool,

    /// Write the effective settings to the default settings file
    #[arg(long)]
    save: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let settings = load_settings(&cli)?;

    if cli.save {
        settings.save();
    }

    let server = AudioServer::with_default_backend(settings);
    if cli.print_env {
        for (key, value) in server.guest_environment() {
            println!("{}={}", key, value);
        }
        return Ok(());
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    log::info!("Starting aserver");
    server.start()?;
    for (key, value) in server.guest_environment() {
        log::info!("Guest environment: {}={}", key, value);
    }

    // Blocks until a signal arrives (or the handler is dropped)
    let _ = rx.recv();
    log::info!("Shutting down");
    server.stop();
    Ok(())
}

fn load_settings(cli: &Cli) -> Result<ServerSettings, Box<dyn Error>> {
    let mut settings = match &cli.config {
        Some(path) => ServerSettings::load_from(path)?,
        None => ServerSettings::load(),
    };

    if let Some(socket) = &cli.socket {
        settings.socket_path = socket.clone();
    }
    if let Some(options) = &cli.options {
        settings.audio = AudioOptions::from_key_values(options)?;
    }
    if cli.no_shm {
        settings.use_shm = false;
    }
    if cli.single_threaded {
        settings.multithreaded_clients = false;
    }

    log::debug!("Effective settings: {:?}", settings);
    Ok(settings)
}
