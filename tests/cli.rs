use std::path::Path;
use std::process::Command;

use simtomp::directive::{DirectiveKind, Expr, Stmt};
use simtomp::UnitBuilder;

fn write_unit(dir: &Path) -> std::path::PathBuf {
    let mut b = UnitBuilder::new();
    let par = b
        .directive(DirectiveKind::Parallel)
        .with_body(Stmt::observe(1, Expr::ThreadId));
    let target = b.directive(DirectiveKind::Target).with_body(Stmt::directive(par));
    b.host_function("main", vec![], Stmt::directive(target));
    let path = dir.join("unit.json");
    std::fs::write(&path, b.finish().to_json().expect("serialize")).expect("write unit");
    path
}

fn simtomp(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_simtomp"))
        .args(args)
        .output()
        .expect("run simtomp")
}

#[test]
fn test_build_writes_module_next_to_input() {
    let dir = tempfile::tempdir().unwrap();
    let unit = write_unit(dir.path());
    let out = simtomp(&["build", unit.to_str().unwrap(), "--hash"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let module = std::fs::read_to_string(dir.path().join("unit.sir")).expect("module written");
    assert!(module.contains("__omp_offloading_main_r1"));
    assert!(module.contains("__omp_offloading_main_r1_worker"));
    let stdout = String::from_utf8_lossy(&out.stdout);
    let hash = stdout.split_whitespace().next().unwrap_or_default();
    assert_eq!(hash, blake3::hash(module.as_bytes()).to_hex().as_str());
}

#[test]
fn test_run_reports_worker_observations() {
    let dir = tempfile::tempdir().unwrap();
    let unit = write_unit(dir.path());
    let out = simtomp(&["run", unit.to_str().unwrap(), "--threads", "64", "--json"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let report: serde_json::Value = serde_json::from_slice(&out.stdout).expect("json report");
    let observations = report["observations"].as_array().expect("observations");
    assert_eq!(observations.len(), 32);
    assert!(observations.iter().all(|o| o["tag"] == 1));
    let regions = report["trace"]
        .as_array()
        .expect("trace")
        .iter()
        .filter(|e| e["event"] == "region" && e["regime"] == "level0")
        .count();
    assert_eq!(regions, 1);
}

#[test]
fn test_malformed_tree_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{ \"functions\": [ { \"name\": 3 } ] }").unwrap();
    let out = simtomp(&["build", path.to_str().unwrap(), "--stdout"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("malformed directive tree"));
}

#[test]
fn test_run_on_a_device_file() {
    let dir = tempfile::tempdir().unwrap();
    let unit = write_unit(dir.path());
    let device = Path::new(env!("CARGO_MANIFEST_DIR")).join("targets/tiny.toml");
    let out = simtomp(&[
        "run",
        unit.to_str().unwrap(),
        "--device-config",
        device.to_str().unwrap(),
        "--threads",
        "16",
        "--json",
    ]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let report: serde_json::Value = serde_json::from_slice(&out.stdout).expect("json report");
    let tids: Vec<u64> = report["observations"]
        .as_array()
        .expect("observations")
        .iter()
        .filter_map(|o| o["tid"].as_u64())
        .collect();
    assert_eq!(tids, (0..12).collect::<Vec<u64>>());
}
