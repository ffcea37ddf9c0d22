pub mod build;
pub mod config;
pub mod plan;
pub mod run;

use std::path::{Path, PathBuf};
use std::process;

use clap::Args;

use simtomp::diagnostic::{render_diagnostics, Diagnostic};
use simtomp::{DeviceConfig, TranslationUnit};

/// Device selection shared by every command.
#[derive(Args, Clone)]
pub struct DeviceArgs {
    /// Device name (built-in or targets/<name>.toml)
    #[arg(long, default_value = "nvptx")]
    pub device: String,
    /// Device configuration file (overrides --device)
    #[arg(long, value_name = "PATH")]
    pub device_config: Option<PathBuf>,
}

pub fn resolve_device(args: &DeviceArgs) -> DeviceConfig {
    let result = match &args.device_config {
        Some(path) => DeviceConfig::load(path),
        None => DeviceConfig::resolve(&args.device),
    };
    match result {
        Ok(cfg) => cfg,
        Err(diag) => {
            diag.render_plain("<config>");
            process::exit(1);
        }
    }
}

/// A loaded directive tree and the C source its spans point into.
pub struct LoadedUnit {
    pub path: PathBuf,
    pub unit: TranslationUnit,
    pub source: Option<(String, String)>,
}

pub fn load_unit(path: &Path) -> LoadedUnit {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("error: cannot read '{}': {}", path.display(), e);
            process::exit(1);
        }
    };
    let unit = match simtomp::load_unit(&text) {
        Ok(u) => u,
        Err(diags) => {
            render_diagnostics(&diags, &path.display().to_string(), None);
            process::exit(1);
        }
    };
    // Spans refer to the C source, resolved next to the tree when relative.
    let source = unit.source.as_ref().and_then(|src| {
        let src_path = match path.parent() {
            Some(dir) if Path::new(src).is_relative() => dir.join(src),
            _ => PathBuf::from(src),
        };
        std::fs::read_to_string(&src_path)
            .ok()
            .map(|text| (src.clone(), text))
    });
    LoadedUnit {
        path: path.to_path_buf(),
        unit,
        source,
    }
}

impl LoadedUnit {
    /// Render `diags` and exit.
    pub fn fail(&self, diags: &[Diagnostic]) -> ! {
        match &self.source {
            Some((name, text)) => render_diagnostics(diags, name, Some(text)),
            None => render_diagnostics(diags, &self.path.display().to_string(), None),
        }
        process::exit(1);
    }

    pub fn compile(&self, cfg: &DeviceConfig) -> simtomp::Module {
        match simtomp::compile_unit(&self.unit, cfg) {
            Ok(m) => m,
            Err(diags) => self.fail(&diags),
        }
    }
}
