use clap::Args;

use super::{resolve_device, DeviceArgs};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
}

pub fn cmd_config(args: ConfigArgs) {
    let cfg = resolve_device(&args.device);
    println!("{} ({})", cfg.display_name, cfg.name);
    println!("  warp size              {}", cfg.warp_size);
    println!("  max worker threads     {}", cfg.max_worker_threads);
    println!("  max threads per block  {}", cfg.max_threads_per_block);
    println!("  shared address space   {}", cfg.shared_address_space);
    println!("  pointer width          {}", cfg.pointer_width);
    println!("  task / simd state      {} / {}", cfg.task_state_size, cfg.simd_state_size);
    println!("data sharing");
    println!("  slot size              {}", cfg.slot_size);
    println!("  worker warp slot size  {}", cfg.worker_warp_slot_size());
    println!("  worker warps           {}", cfg.num_worker_warps());
    println!("  master slot bytes      {}", cfg.master_slot_bytes());
    println!("  worker slot bytes      {}", cfg.worker_warp_slot_bytes());
    println!("  team root bytes        {}", cfg.team_root_bytes());
    println!("  max teams              {}", cfg.max_teams);
    let n = cfg.max_threads_per_block;
    println!("full block of {}", n);
    println!("  master thread          {}", cfg.master_thread_id(n));
    println!("  workers                {}", cfg.num_workers(n));
}
