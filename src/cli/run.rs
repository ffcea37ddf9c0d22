use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;

use clap::Args;

use simtomp::ir::sir::Width;
use simtomp::runtime::TraceKind;
use simtomp::{KernelArg, SimConfig};

use super::{load_unit, resolve_device, DeviceArgs};

#[derive(Args)]
pub struct RunArgs {
    /// Directive tree (.json)
    pub input: PathBuf,
    /// Kernel to launch (default: the first one)
    #[arg(long)]
    pub kernel: Option<String>,
    /// Threads per block
    #[arg(long, default_value_t = 128)]
    pub threads: u32,
    /// Number of blocks
    #[arg(long, default_value_t = 1)]
    pub blocks: u32,
    /// Slot pool arena bytes per warp
    #[arg(long, default_value_t = 64 * 1024)]
    pub pool: u64,
    /// Kernel argument: an integer, or `i32:1,2,3` / `i64:...` for a buffer
    #[arg(long = "arg", value_name = "ARG")]
    pub args: Vec<String>,
    /// Print the launch report as JSON
    #[arg(long)]
    pub json: bool,
    #[command(flatten)]
    pub device: DeviceArgs,
}

fn parse_arg(text: &str) -> Result<KernelArg, String> {
    let Some((width, values)) = text.split_once(':') else {
        return text
            .parse()
            .map(KernelArg::scalar)
            .map_err(|_| format!("invalid kernel argument '{}'", text));
    };
    let width = match width {
        "i8" => Width::I8,
        "i32" => Width::I32,
        "i64" => Width::I64,
        other => return Err(format!("unknown buffer width '{}'", other)),
    };
    let values = values
        .split(',')
        .filter(|v| !v.is_empty())
        .map(|v| v.trim().parse::<i64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| format!("invalid buffer '{}'", text))?;
    Ok(KernelArg::array(values, width))
}

pub fn cmd_run(args: RunArgs) {
    let cfg = resolve_device(&args.device);
    let loaded = load_unit(&args.input);
    let module = loaded.compile(&cfg);

    let kernel = match args.kernel.clone().or_else(|| module.kernels().next().map(|k| k.name.clone())) {
        Some(k) => k,
        None => {
            eprintln!("error: {} contains no target regions", args.input.display());
            process::exit(1);
        }
    };
    let mut kargs = Vec::with_capacity(args.args.len());
    for a in &args.args {
        match parse_arg(a) {
            Ok(k) => kargs.push(k),
            Err(msg) => {
                eprintln!("error: {}", msg);
                process::exit(1);
            }
        }
    }

    let sim = SimConfig::default()
        .with_threads(args.threads)
        .with_blocks(args.blocks)
        .with_pool_capacity(args.pool);
    let report = match simtomp::launch(&module, &kernel, &mut kargs, &sim, &cfg) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("error: cannot serialize report: {}", e);
                process::exit(1);
            }
        }
        return;
    }

    println!(
        "{}: {} block(s) x {} threads, {} steps",
        report.kernel, report.blocks, report.threads_per_block, report.steps
    );
    let mut regions: BTreeMap<String, usize> = BTreeMap::new();
    let mut dispatches = 0;
    let mut iterations = 0;
    for event in &report.trace {
        match event.kind {
            TraceKind::Region { regime } => *regions.entry(regime.to_string()).or_default() += 1,
            TraceKind::WorkerDispatch { .. } => dispatches += 1,
            TraceKind::ConvergentIteration { .. } => iterations += 1,
        }
    }
    for (regime, n) in &regions {
        println!("  {:<12} {} region entries", regime, n);
    }
    println!("  {} worker dispatches, {} convergent iterations", dispatches, iterations);
    for o in &report.observations {
        println!("  observe[{}] block {} tid {} = {}", o.tag, o.block, o.tid, o.value);
    }
    for (i, a) in kargs.iter().enumerate() {
        if let KernelArg::Buffer { values, .. } = a {
            println!("  arg {} = {:?}", i, values);
        }
    }
}
