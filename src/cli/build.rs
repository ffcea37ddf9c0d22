use std::path::PathBuf;
use std::process;

use clap::Args;

use super::{load_unit, resolve_device, DeviceArgs};

#[derive(Args)]
pub struct BuildArgs {
    /// Directive tree (.json)
    pub input: PathBuf,
    /// Output module (default: <input>.sir)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Print the BLAKE3 fingerprint of the generated module
    #[arg(long)]
    pub hash: bool,
    /// Write the module to stdout instead of a file
    #[arg(long, conflicts_with = "output")]
    pub stdout: bool,
    #[command(flatten)]
    pub device: DeviceArgs,
}

pub fn cmd_build(args: BuildArgs) {
    let cfg = resolve_device(&args.device);
    let loaded = load_unit(&args.input);
    let module = loaded.compile(&cfg);
    let text = module.to_string();

    if args.stdout {
        print!("{}", text);
    } else {
        let out_path = args
            .output
            .unwrap_or_else(|| args.input.with_extension("sir"));
        if let Err(e) = std::fs::write(&out_path, &text) {
            eprintln!("error: cannot write '{}': {}", out_path.display(), e);
            process::exit(1);
        }
        eprintln!(
            "Compiled {} -> {} ({} kernels, {} functions)",
            args.input.display(),
            out_path.display(),
            module.kernels().count(),
            module.functions.len()
        );
    }

    if args.hash {
        let hash = blake3::hash(text.as_bytes());
        println!("{}  {}", hash.to_hex(), module.name);
    }
}
