use std::path::PathBuf;

use clap::Args;

use super::{load_unit, resolve_device, DeviceArgs};

#[derive(Args)]
pub struct PlanArgs {
    /// Directive tree (.json)
    pub input: PathBuf,
    #[command(flatten)]
    pub device: DeviceArgs,
}

pub fn cmd_plan(args: PlanArgs) {
    let cfg = resolve_device(&args.device);
    let loaded = load_unit(&args.input);
    let plans = match simtomp::plan_unit(&loaded.unit, &cfg) {
        Ok(p) => p,
        Err(diags) => loaded.fail(&diags),
    };
    if plans.is_empty() {
        eprintln!("no data-sharing contexts in {}", args.input.display());
        return;
    }
    for ctx in plans {
        println!("{}", ctx);
    }
}
