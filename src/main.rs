use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

#[derive(Parser)]
#[command(
    name = "simtomp",
    version,
    about = "OpenMP offloading code generator for SIMT devices"
)]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate the device module for a directive tree
    Build(cli::build::BuildArgs),
    /// Print the data-sharing plan of every context
    Plan(cli::plan::PlanArgs),
    /// Generate and execute a kernel on the SIMT simulator
    Run(cli::run::RunArgs),
    /// Show a device configuration and its derived constants
    Config(cli::config::ConfigArgs),
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = if verbose > 0 {
        EnvFilter::new(default)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Build(args) => cli::build::cmd_build(args),
        Command::Plan(args) => cli::plan::cmd_plan(args),
        Command::Run(args) => cli::run::cmd_run(args),
        Command::Config(args) => cli::config::cmd_config(args),
    }
}
