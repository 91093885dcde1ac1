//! netbed CLI
//!
//! Runs the built-in ping protocol under either backend, or the neighbor
//! directory that emulated nodes register with.
//!
//! # Example
//!
//! ```bash
//! # Five simulated nodes, links from a topology file, paced at real time
//! netbed simulate --nodes 5 --topology demos/ring.topo
//!
//! # A directory and two emulated nodes, each in its own terminal
//! netbed directory --port 8888
//! netbed emulate --port 10001
//! netbed emulate --port 10002
//! ```
//!
//! Lines typed on stdin are control commands (`edge`, `fail`, `restart`,
//! `echo`, `exit`, or a message for protocol code). Ctrl-C is `exit`.

use std::error::Error;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{Receiver, Sender};
use netbed_runner::{
    CommandScript, DirectoryConfig, DirectoryServer, Emulator, EmulatorConfig, FileConfig,
    PingNode, RunSummary, Simulator, SimulatorConfig, DEFAULT_DIRECTORY_PORT,
};
use parking_lot::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Network protocol testbed
#[derive(Parser, Debug)]
#[command(name = "netbed")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Simulate many nodes in this process on a virtual clock
    Simulate(SimulateArgs),
    /// Run one node over real UDP, registered with a directory
    Emulate(EmulateArgs),
    /// Serve neighbor lists to emulated nodes
    Directory(DirectoryArgs),
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Number of nodes (addresses 0..N)
    #[arg(short = 'n', long)]
    nodes: usize,

    /// Topology script applied at startup
    #[arg(short = 't', long)]
    topology: Option<PathBuf>,

    /// Command script fed one line per loop iteration
    #[arg(short = 'c', long)]
    commands: Option<PathBuf>,

    /// Virtual seconds per wall-clock second; 0 runs as fast as possible
    #[arg(long)]
    timescale: Option<f64>,

    /// Seed for loss draws
    #[arg(long)]
    seed: Option<u64>,

    /// YAML file with the default link profile, timescale and seed
    #[arg(long)]
    config: Option<PathBuf>,

    /// Connect every pair of nodes with the default link
    #[arg(long)]
    all_to_all: bool,
}

#[derive(Args, Debug)]
struct EmulateArgs {
    /// Directory host
    #[arg(long, default_value = "localhost")]
    directory_host: String,

    /// Directory TCP port
    #[arg(long, default_value_t = DEFAULT_DIRECTORY_PORT)]
    directory_port: u16,

    /// Local UDP port
    #[arg(short = 'p', long, default_value = "10000")]
    port: u16,

    /// Command script fed one line per loop iteration
    #[arg(short = 'c', long)]
    commands: Option<PathBuf>,

    /// Seed for loss draws
    #[arg(long)]
    seed: Option<u64>,

    /// YAML file with the seed
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct DirectoryArgs {
    /// TCP port to listen on
    #[arg(short = 'p', long, default_value_t = DEFAULT_DIRECTORY_PORT)]
    port: u16,

    /// Topology script; without one every pair of nodes is connected
    #[arg(short = 't', long)]
    topology: Option<PathBuf>,

    /// YAML file with the default link profile
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,netbed=info")),
        )
        .init();
    netbed_metrics::describe_metrics();

    let cli = Cli::parse();
    let result = match cli.mode {
        Mode::Simulate(args) => simulate(args).map(Some),
        Mode::Emulate(args) => emulate(args).map(Some),
        Mode::Directory(args) => directory(args).map(|()| None),
    };

    match result {
        Ok(summary) => {
            if let Some(summary) = summary {
                info!(
                    elapsed_ms = summary.elapsed.as_millis() as u64,
                    sent = summary.sent,
                    dropped = summary.dropped,
                    lost = summary.lost,
                    "Run finished"
                );
                eprintln!("{summary}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Startup failed");
            eprintln!("netbed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_file_config(path: Option<&PathBuf>) -> Result<FileConfig, Box<dyn Error>> {
    Ok(match path {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    })
}

fn simulate(args: SimulateArgs) -> Result<RunSummary, Box<dyn Error>> {
    let file = load_file_config(args.config.as_ref())?;
    let mut config = SimulatorConfig::new(args.nodes)
        .with_file(&file)
        .with_all_to_all(args.all_to_all);
    if let Some(timescale) = args.timescale {
        config = config.with_timescale(timescale);
    }
    if let Some(seed) = args.seed {
        config = config.with_seed(seed);
    }

    let mut simulator = Simulator::new(config, PingNode::new)?;
    if let Some(path) = &args.topology {
        simulator.load_topology(CommandScript::open(path)?);
    }
    if let Some(path) = &args.commands {
        simulator.set_command_script(CommandScript::open(path)?);
    }

    Ok(simulator.run(spawn_console()?))
}

fn emulate(args: EmulateArgs) -> Result<RunSummary, Box<dyn Error>> {
    let file = load_file_config(args.config.as_ref())?;
    let mut config = EmulatorConfig::new(args.directory_host, args.directory_port, args.port)
        .with_file(&file);
    if let Some(seed) = args.seed {
        config = config.with_seed(seed);
    }

    let mut emulator = Emulator::connect(&config, PingNode::new)?;
    if let Some(path) = &args.commands {
        emulator.set_command_script(CommandScript::open(path)?);
    }

    Ok(emulator.run(spawn_console()?))
}

fn directory(args: DirectoryArgs) -> Result<(), Box<dyn Error>> {
    let file = load_file_config(args.config.as_ref())?;
    let config = DirectoryConfig::new(args.port)
        .with_file(&file)
        .with_all_to_all(args.topology.is_none());
    let topology = args.topology.as_ref().map(CommandScript::open).transpose()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let server = DirectoryServer::bind(&config).await?;

        let handle = server.handle();
        let console = spawn_console()?;
        thread::Builder::new()
            .name("directory-console".to_string())
            .spawn(move || {
                for line in console.iter() {
                    handle.execute(&line);
                }
            })?;

        server.run(topology).await?;
        Ok::<(), Box<dyn Error>>(())
    })
}

/// Lines from stdin. The channel closes at end of input; Ctrl-C sends
/// `exit` while stdin is still open.
fn spawn_console() -> io::Result<Receiver<String>> {
    let (tx, rx) = crossbeam_channel::unbounded();
    let sender: Arc<Mutex<Option<Sender<String>>>> = Arc::new(Mutex::new(Some(tx)));

    let on_signal = sender.clone();
    if let Err(e) = ctrlc::set_handler(move || match on_signal.lock().as_ref() {
        Some(tx) => {
            let _ = tx.send("exit".to_string());
        }
        None => std::process::exit(130),
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler");
    }

    thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                let guard = sender.lock();
                let Some(tx) = guard.as_ref() else {
                    break;
                };
                if tx.send(line).is_err() {
                    break;
                }
            }
            sender.lock().take();
        })?;

    Ok(rx)
}
