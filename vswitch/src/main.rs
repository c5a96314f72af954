use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{ArgAction, Parser};
use nix::sys::signal::Signal;
use nix::sys::signalfd::{SigSet, SignalFd};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vswitch::factory::PortFactory;
use vswitch::server::Server;
use vswitch::switch::VirtioSwitch;
use vswitch::transport::dataspace_id;
use vswitch::virtio::DataspaceId;

/// Default factory socket path.
const SOCKET_PATH: &str = "/run/vswitch.sock";

/// A virtual layer-2 network switch with virtio-net ports.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Buffers per virtqueue; power of two up to 0x8000.
    #[arg(short = 's', long = "size", default_value_t = 0x100)]
    size: u32,

    /// Maximum number of ports.
    #[arg(short = 'p', long = "ports", default_value_t = 5)]
    ports: usize,

    /// Assign a MAC address to each port.
    #[arg(short = 'm', long = "mac")]
    assign_mac: bool,

    /// Register a trusted dataspace backing file; may repeat.
    #[arg(short = 'd', long = "register-ds", value_name = "PATH")]
    register_ds: Vec<PathBuf>,

    /// Verbosity: a level (quiet, warn, info, debug, trace) or a
    /// component directive like `port=trace`; may repeat.
    #[arg(short = 'D', long = "debug", value_name = "SPEC")]
    debug: Vec<String>,

    /// Only report errors.
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// Increase verbosity; may repeat.
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// Factory socket path.
    #[arg(long = "socket", value_name = "PATH", default_value = SOCKET_PATH)]
    socket: PathBuf,
}

fn level_of(word: &str) -> Option<&'static str> {
    match word {
        "quiet" => Some("error"),
        "warn" => Some("warn"),
        "info" => Some("info"),
        "debug" => Some("debug"),
        "trace" => Some("trace"),
        _ => None,
    }
}

/// Map the `-q`/`-v`/`-D` surface onto an `EnvFilter`: `-D` levels
/// move the default, `-D <component>=<level>` directives pass through
/// as tracing targets.
fn verbosity_filter(cli: &Cli) -> String {
    let mut base = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };

    let mut directives = Vec::new();
    for spec in &cli.debug {
        if let Some(level) = level_of(spec) {
            base = level;
        } else {
            directives.push(spec.clone());
        }
    }

    std::iter::once(base.to_string())
        .chain(directives)
        .collect::<Vec<_>>()
        .join(",")
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity_filter(&cli)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if cli.size == 0 || cli.size > 0x8000 || !cli.size.is_power_of_two() {
        bail!(
            "virtqueue size must be a power of two between 1 and 0x8000, got {}",
            cli.size
        );
    }

    let mut trusted: Vec<DataspaceId> = Vec::new();
    for path in &cli.register_ds {
        let file = std::fs::File::open(path)
            .with_context(|| format!("trusted dataspace {}", path.display()))?;
        trusted.push(dataspace_id(&file)?);
    }

    let switch = VirtioSwitch::new(cli.ports);
    let factory = PortFactory::new(cli.size as u16, cli.assign_mac, trusted);

    // A stale socket from a previous run would fail the bind.
    let _ = std::fs::remove_file(&cli.socket);
    let mut server =
        Server::new(switch, factory, &cli.socket).context("starting control server")?;

    // SIGINT/SIGTERM stop the event loop via the shutdown eventfd.
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.thread_block().context("blocking signals")?;
    let signal_fd = SignalFd::new(&mask).context("signalfd")?;
    let shutdown = server.shutdown_handle()?;
    std::thread::spawn(move || {
        let mut signal_fd = signal_fd;
        let _ = signal_fd.read_signal();
        let _ = shutdown.write(1);
    });

    info!(
        ports = cli.ports,
        vq_size = cli.size,
        "virtio net switch running"
    );
    server.run()?;
    info!("switch stopped");
    Ok(())
}
