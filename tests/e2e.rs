//! End-to-end test: create a project, instrument it, build it, run it,
//! verify the trace output.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Create a minimal Rust project that we can instrument.
fn create_mini_project(dir: &Path) {
    fs::create_dir_all(dir.join("src")).unwrap();

    fs::write(
        dir.join("Cargo.toml"),
        r#"[package]
name = "mini"
version = "0.1.0"
edition = "2021"

[[bin]]
name = "mini"
path = "src/main.rs"
"#,
    )
    .unwrap();

    fs::write(
        dir.join("src").join("main.rs"),
        r#"fn main() {
    let result = work(1000);
    println!("result: {result}");
}

fn work(n: u64) -> u64 {
    let mut sum = 0u64;
    for i in 0..n {
        sum += step(i);
    }
    sum
}

fn step(i: u64) -> u64 {
    i
}
"#,
    )
    .unwrap();
}

/// Collect every .json file under `dir`, recursively.
fn json_files_under(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "json") {
                found.push(path);
            }
        }
    }
    found
}

fn build_mini(project_dir: &Path) -> PathBuf {
    let waylay_bin = env!("CARGO_BIN_EXE_waylay");
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let runtime_path = manifest_dir.join("waylay-runtime");

    let output = Command::new(waylay_bin)
        .args(["build", "--project"])
        .arg(project_dir)
        .arg("--runtime-path")
        .arg(&runtime_path)
        .output()
        .expect("failed to run waylay build");

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "waylay build failed:\nstderr: {stderr}\nstdout: {stdout}"
    );
    assert!(
        stderr.contains("found 3 function(s)"),
        "should report resolved functions, got: {stderr}"
    );

    // stdout (non-tty) carries the path to the built binary.
    let binary_path = PathBuf::from(stdout.trim());
    assert!(
        binary_path.exists(),
        "built binary should exist at: {}",
        binary_path.display()
    );
    binary_path
}

#[test]
fn full_pipeline_instrument_build_run_trace() {
    let tmp = tempfile::tempdir().unwrap();
    let project_dir = tmp.path().join("mini");
    create_mini_project(&project_dir);

    let binary = build_mini(&project_dir);

    // Run the instrumented binary with trace output into a temp dir.
    let trace_dir = tmp.path().join("traces");
    let run_output = Command::new(&binary)
        .env("WAYLAY_TRACE_OUTPUT", &trace_dir)
        .output()
        .expect("failed to run instrumented binary");

    assert!(
        run_output.status.success(),
        "instrumented binary failed:\n{}",
        String::from_utf8_lossy(&run_output.stderr)
    );

    // The program still behaves as written.
    let program_stdout = String::from_utf8_lossy(&run_output.stdout);
    assert!(
        program_stdout.contains("result: 499500"),
        "program should produce correct output, got: {program_stdout}"
    );

    // A trace file exists and records the call tree.
    let files = json_files_under(&trace_dir);
    assert!(
        !files.is_empty(),
        "expected a trace file under {}",
        trace_dir.display()
    );
    let content = fs::read_to_string(&files[0]).unwrap();
    assert!(
        content.contains("\"work\""),
        "trace should contain the root call, got: {content}"
    );
    assert!(
        content.contains("\"step\""),
        "trace should contain nested calls, got: {content}"
    );
}

#[test]
fn trace_stdout_mode_prints_payload_lines() {
    let tmp = tempfile::tempdir().unwrap();
    let project_dir = tmp.path().join("mini");
    create_mini_project(&project_dir);

    let binary = build_mini(&project_dir);

    let run_output = Command::new(&binary)
        .env("WAYLAY_TRACE_OUTPUT", "stdout")
        .output()
        .expect("failed to run instrumented binary");

    assert!(run_output.status.success());
    let stdout = String::from_utf8_lossy(&run_output.stdout);
    // Task id, colon, then the JSON payload on one line.
    assert!(
        stdout.lines().any(|l| {
            l.split_once(": ").is_some_and(|(task, payload)| {
                task.parse::<u64>().is_ok() && payload.contains("\"work\"")
            })
        }),
        "expected a `task: payload` trace line, got: {stdout}"
    );
}

#[test]
fn trace_off_disables_export() {
    let tmp = tempfile::tempdir().unwrap();
    let project_dir = tmp.path().join("mini");
    create_mini_project(&project_dir);

    let binary = build_mini(&project_dir);

    let run_output = Command::new(&binary)
        .env("WAYLAY_TRACE_OUTPUT", "off")
        .current_dir(tmp.path())
        .output()
        .expect("failed to run instrumented binary");

    assert!(run_output.status.success());
    // No trace_<timestamp> directory appears next to the process.
    let generated: Vec<_> = fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("trace_"))
        .collect();
    assert!(generated.is_empty(), "tracing should be disabled");
}
