use std::path::{Path, PathBuf};

use crate::diagnostic::Diagnostic;
use crate::span::Span;

/// Device configuration: every constant the lowering bakes into the
/// generated protocol.
///
/// The built-in `nvptx()` values are the ones the device runtime library
/// is compiled against; a custom TOML file must agree with the runtime it
/// will be linked with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Short identifier used in CLI and file paths (e.g. "nvptx").
    pub name: String,
    /// Human-readable name.
    pub display_name: String,
    /// Lanes per group (hardware warp). Must be a power of two.
    pub warp_size: u32,
    /// Maximum resident worker lanes per block.
    pub max_worker_threads: u32,
    /// Hardware block size limit.
    pub max_threads_per_block: u32,
    /// Default payload of a master data-sharing slot in bytes.
    pub slot_size: u32,
    /// Number of teams the root slot table is sized for.
    pub max_teams: u32,
    /// Private state buffer for the convergent parallel step.
    pub task_state_size: u32,
    /// Private state buffer for the convergent simd step.
    pub simd_state_size: u32,
    /// Address space of block-shared globals.
    pub shared_address_space: u32,
    /// Pointer size in bytes.
    pub pointer_width: u32,
}

impl DeviceConfig {
    /// Built-in NVPTX configuration.
    pub fn nvptx() -> Self {
        Self {
            name: "nvptx".to_string(),
            display_name: "NVPTX (64-bit)".to_string(),
            warp_size: 32,
            max_worker_threads: 992,
            max_threads_per_block: 1024,
            slot_size: 4,
            max_teams: 1024,
            task_state_size: 48,
            simd_state_size: 48,
            shared_address_space: 3,
            pointer_width: 8,
        }
    }

    /// Load a device configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Diagnostic> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Diagnostic::error(
                format!("cannot read device config '{}': {}", path.display(), e),
                Span::dummy(),
            )
        })?;
        Self::parse_toml(&content, path)
    }

    /// Resolve a device by name: built-ins first, then `targets/{name}.toml`
    /// relative to the binary or the working directory.
    pub fn resolve(name: &str) -> Result<Self, Diagnostic> {
        if name.contains('/') || name.contains('\\') || name.contains("..") || name.starts_with('.')
        {
            return Err(Diagnostic::error(
                format!("invalid device name '{}'", name),
                Span::dummy(),
            ));
        }

        if name == "nvptx" || name == "nvptx64" {
            return Ok(Self::nvptx());
        }

        let relative = format!("targets/{}.toml", name);
        for base in search_roots() {
            let path = base.join(&relative);
            if path.exists() {
                return Self::load(&path);
            }
        }

        Err(Diagnostic::error(
            format!("unknown device '{}' (looked for '{}')", name, relative),
            Span::dummy(),
        )
        .with_help("built-in devices: nvptx".to_string()))
    }

    fn parse_toml(content: &str, path: &Path) -> Result<Self, Diagnostic> {
        let err =
            |msg: String| Diagnostic::error(format!("{}: {}", path.display(), msg), Span::dummy());
        let num = |key: &str, value: &str| -> Result<u32, Diagnostic> {
            value
                .parse()
                .map_err(|_| err(format!("invalid {}: {}", key, value)))
        };

        // Unset keys keep the NVPTX defaults so a file only states what differs.
        let mut cfg = Self::nvptx();
        cfg.name.clear();
        let mut section = String::new();

        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                section = trimmed[1..trimmed.len() - 1].trim().to_string();
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(err(format!("expected 'key = value', found '{}'", trimmed)));
            };
            let key = key.trim();
            let value = value.trim();
            let unquoted = value.trim_matches('"');

            match (section.as_str(), key) {
                ("device", "name") => cfg.name = unquoted.to_string(),
                ("device", "display_name") => cfg.display_name = unquoted.to_string(),
                ("warp", "size") => cfg.warp_size = num("warp.size", value)?,
                ("threads", "max_workers") => {
                    cfg.max_worker_threads = num("threads.max_workers", value)?
                }
                ("threads", "max_per_block") => {
                    cfg.max_threads_per_block = num("threads.max_per_block", value)?
                }
                ("data_sharing", "slot_size") => {
                    cfg.slot_size = num("data_sharing.slot_size", value)?
                }
                ("data_sharing", "max_teams") => {
                    cfg.max_teams = num("data_sharing.max_teams", value)?
                }
                ("convergent", "task_state_size") => {
                    cfg.task_state_size = num("convergent.task_state_size", value)?
                }
                ("convergent", "simd_state_size") => {
                    cfg.simd_state_size = num("convergent.simd_state_size", value)?
                }
                ("memory", "shared_address_space") => {
                    cfg.shared_address_space = num("memory.shared_address_space", value)?
                }
                ("memory", "pointer_width") => {
                    cfg.pointer_width = num("memory.pointer_width", value)?
                }
                (s, k) => {
                    return Err(err(format!("unknown key '{}' in section [{}]", k, s)));
                }
            }
        }

        if cfg.name.is_empty() {
            return Err(err("missing device.name".to_string()));
        }
        cfg.validate().map_err(|msg| err(msg))?;
        Ok(cfg)
    }

    /// Check the structural assumptions the protocol relies on.
    pub fn validate(&self) -> Result<(), String> {
        if self.warp_size == 0 || !self.warp_size.is_power_of_two() {
            return Err(format!("warp.size must be a power of two, got {}", self.warp_size));
        }
        if self.warp_size > 64 {
            return Err(format!("warp.size {} exceeds the 64-lane mask", self.warp_size));
        }
        if self.max_worker_threads == 0 || self.max_worker_threads % self.warp_size != 0 {
            return Err(format!(
                "threads.max_workers ({}) must be a non-zero multiple of warp.size ({})",
                self.max_worker_threads, self.warp_size
            ));
        }
        if self.max_worker_threads + self.warp_size > self.max_threads_per_block {
            return Err(format!(
                "threads.max_workers + warp.size ({}) exceeds threads.max_per_block ({})",
                self.max_worker_threads + self.warp_size,
                self.max_threads_per_block
            ));
        }
        if self.slot_size == 0 {
            return Err("data_sharing.slot_size must be > 0".to_string());
        }
        if self.max_teams == 0 {
            return Err("data_sharing.max_teams must be > 0".to_string());
        }
        if self.task_state_size < 16 || self.simd_state_size < 16 {
            return Err("convergent state buffers must hold at least 16 bytes".to_string());
        }
        if self.pointer_width != 4 && self.pointer_width != 8 {
            return Err(format!("memory.pointer_width must be 4 or 8, got {}", self.pointer_width));
        }
        Ok(())
    }

    // ── derived constants ──

    pub fn warp_log2(&self) -> u32 {
        self.warp_size.trailing_zeros()
    }

    /// Mask selecting the lane-in-warp bits of a thread id.
    pub fn lane_mask(&self) -> u32 {
        self.warp_size - 1
    }

    /// Payload of a worker-warp slot: one `slot_size` element per lane.
    pub fn worker_warp_slot_size(&self) -> u32 {
        self.warp_size * self.slot_size
    }

    pub fn num_worker_warps(&self) -> u32 {
        self.max_worker_threads / self.warp_size
    }

    /// Slot header: `next` and `data_end` pointers.
    pub fn slot_header_size(&self) -> u32 {
        2 * self.pointer_width
    }

    pub fn master_slot_bytes(&self) -> u32 {
        align_up(self.slot_header_size() + self.slot_size, self.pointer_width)
    }

    pub fn worker_warp_slot_bytes(&self) -> u32 {
        align_up(
            self.slot_header_size() + self.worker_warp_slot_size(),
            self.pointer_width,
        )
    }

    /// Bytes of root slot data owned by one team.
    pub fn team_root_bytes(&self) -> u64 {
        self.master_slot_bytes() as u64
            + self.num_worker_warps() as u64 * self.worker_warp_slot_bytes() as u64
    }

    /// The first lane of the last group of a block of `threads` lanes.
    pub fn master_thread_id(&self, threads: u32) -> u32 {
        threads.saturating_sub(1) & !(self.warp_size - 1)
    }

    /// Thread id relative to the team, excluding the master group.
    pub fn team_thread_id(&self, tid: u32, threads: u32) -> u32 {
        tid & self.master_thread_id(threads).wrapping_sub(1)
    }

    /// Lanes available to run dispatched work.
    pub fn num_workers(&self, threads: u32) -> u32 {
        threads.saturating_sub(self.warp_size)
    }

    pub fn global_thread_id(&self, block: u32, tid: u32, threads: u32) -> u32 {
        block * self.num_workers(threads) + self.team_thread_id(tid, threads)
    }
}

fn search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent().map(Path::to_path_buf);
        for _ in 0..3 {
            let Some(d) = dir else { break };
            roots.push(d.clone());
            dir = d.parent().map(Path::to_path_buf);
        }
    }
    roots.push(PathBuf::from("."));
    roots
}

pub(crate) fn align_up(value: u32, align: u32) -> u32 {
    if align <= 1 {
        return value;
    }
    value.div_ceil(align) * align
}
