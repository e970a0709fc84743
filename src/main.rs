use std::path::PathBuf;

use clap::Parser;
use monitor::{Machine, MachineConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(version = "0.1", about = "Run an ELF64 payload inside a hardware-virtualized guest")]
struct MonitorOpts {
    /// Payload ELF to run
    payload: String,

    /// Trace categories, comma separated (mem,vcpu,hc,signal,fork,load or "all")
    #[clap(short, long)]
    verbose: Option<String>,

    /// Listen port for the gdb stub
    #[clap(long)]
    gdb_listen: Option<u16>,

    /// Core file path for fatal guest signals
    #[clap(long)]
    coredump: Option<PathBuf>,

    /// Label recorded with snapshots
    #[clap(long)]
    snapshot_label: Option<String>,

    /// Payload arguments
    #[clap(last = true)]
    payload_args: Vec<String>,
}

#[derive(Debug)]
pub enum Error {
    MachineNew(monitor::Error),

    MachineStart(monitor::Error),
}

/// `KM_VERBOSE` and `--verbose` both name trace categories; each becomes
/// a tracing target filter.
fn init_tracing(cli_tags: Option<&str>) {
    let tags = std::env::var("KM_VERBOSE")
        .ok()
        .or_else(|| cli_tags.map(|t| t.to_string()));
    let mut filter = String::from("warn");
    if let Some(tags) = tags {
        for tag in tags.split(',').filter(|t| !t.is_empty()) {
            if tag == "all" {
                filter.push_str(",monitor=trace");
            } else {
                filter.push_str(&format!(",monitor::{tag}=trace"));
            }
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<(), Error> {
    let opts: MonitorOpts = MonitorOpts::parse();
    init_tracing(opts.verbose.as_deref());

    let mut config = MachineConfig::default();
    if let Some(path) = opts.coredump {
        config.coredump = path;
    }
    config.gdb_port = opts.gdb_listen;
    config.snapshot_label = opts.snapshot_label;

    // Create the machine: hypervisor probe, memory skeleton, descriptor
    // tables.
    let machine = Machine::new(config).map_err(Error::MachineNew)?;

    // Guest argv[0] is the payload itself; the monitor's own argv ends at
    // the `--` separator.
    let mut argv = vec![opts.payload.clone()];
    argv.extend(opts.payload_args.iter().cloned());
    let envp: Vec<String> = std::env::vars().map(|(k, v)| format!("{k}={v}")).collect();

    // Load the payload, build the initial stack, start vCPU 0.
    machine
        .start(&opts.payload, &argv, &envp)
        .map_err(Error::MachineStart)?;

    // Serve fork requests until the payload exits; mirror its status.
    let status = machine.run();
    std::process::exit(status);
}
