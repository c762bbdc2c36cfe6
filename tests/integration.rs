//! Integration tests for the mxpool CLI.
//!
//! These run the real binary, so the process backend re-executes it as
//! its own workers.

use assert_cmd::Command;
use mxpool::accumulator::{FinalState, MergePolicy, UnsetRow};
use mxpool::config::{Backend, PoolConfig, RunConfig};
use mxpool::coordinator;
use mxpool::worker::Disposition;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use predicates::prelude::*;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::{TempDir, tempdir};

/// Get a command for the mxpool binary with a clean logging environment.
fn mxpool() -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("mxpool").unwrap();
    for var in [
        "MXPOOL_BACKEND",
        "MXPOOL_POLICY",
        "MXPOOL_LOG_DIR",
        "MXPOOL_LOG",
        "MXPOOL_LOG_FILE",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn write(dir: &TempDir, name: &str, text: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, text).unwrap();
    path
}

/// `(stem, contents)` of every `.out` sink in `dir`.
fn out_sinks(dir: &Path) -> Vec<(String, String)> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "out"))
        .map(|p| {
            let stem = p.file_stem().unwrap().to_string_lossy().into_owned();
            (stem, std::fs::read_to_string(&p).unwrap())
        })
        .collect()
}

fn out_logs(dir: &Path) -> Vec<String> {
    let mut logs: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "out"))
        .map(|p| std::fs::read_to_string(p).unwrap())
        .collect();
    logs.sort();
    logs
}

fn json_of(output: &std::process::Output) -> serde_json::Value {
    let stdout = String::from_utf8(output.stdout.clone()).unwrap();
    serde_json::from_str(&stdout).expect("Output should be valid JSON")
}

/// The padded example: A has one row, W three.
fn padded_example(dir: &TempDir) -> (PathBuf, PathBuf) {
    (
        write(dir, "A.txt", "1 1 1\n"),
        write(dir, "W.txt", "1 0 1 0 1\n0 1 0 1 0\n1 1 1 1 1\n"),
    )
}

// ============================================================================
// Help and Arguments
// ============================================================================

#[test]
fn test_help_displays() {
    mxpool()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--backend"))
        .stdout(predicate::str::contains("--policy"))
        .stdout(predicate::str::contains("--internal-worker").not());
}

#[test]
fn test_version_displays() {
    mxpool()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_too_few_files() {
    let dir = tempdir().unwrap();
    let (a, _) = padded_example(&dir);
    mxpool()
        .arg(&a)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("expecting at least 2 files as input"));
}

#[test]
fn test_unknown_option_exits_1() {
    mxpool().args(["--frobnicate", "A", "W"]).assert().code(1);
}

#[test]
fn test_missing_weights_file() {
    let dir = tempdir().unwrap();
    let (a, _) = padded_example(&dir);
    mxpool()
        .current_dir(dir.path())
        .arg("--once")
        .arg(&a)
        .arg("nope.txt")
        .assert()
        .code(1)
        .stderr(predicate::str::starts_with("error: cannot open file nope.txt"))
        .stderr(predicate::function(|err: &str| err.lines().count() == 1));
    assert!(out_logs(dir.path()).is_empty());
}

#[test]
fn test_missing_stream_file_is_one_error_line() {
    let dir = tempdir().unwrap();
    let (a, w) = padded_example(&dir);
    mxpool()
        .current_dir(dir.path())
        .args(["--dim", "3", "-q"])
        .arg(&a)
        .arg(&w)
        .write_stdin("gone.txt\n")
        .assert()
        .code(1)
        .stderr(predicate::str::starts_with("error: cannot open file gone.txt"))
        .stderr(predicate::function(|err: &str| err.lines().count() == 1));
}

#[test]
fn test_diagnostics_are_plain_when_piped() {
    let dir = tempdir().unwrap();
    let (a, w) = padded_example(&dir);
    mxpool()
        .args(["--dim", "3", "--once", "-v", "--log-dir"])
        .arg(dir.path())
        .arg(&a)
        .arg(&w)
        .assert()
        .success()
        .stderr(predicate::str::contains("Run complete"))
        .stderr(predicate::str::contains("\u{1b}[").not());
}

#[test]
fn test_invalid_matrix_names_line_and_token() {
    let dir = tempdir().unwrap();
    let a = write(&dir, "A.txt", "1 2\n3 x\n");
    let (_, w) = padded_example(&dir);
    mxpool()
        .args(["--once", "--dim", "2"])
        .arg(&a)
        .arg(&w)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("line 2"))
        .stderr(predicate::str::contains("'x'"));
}

// ============================================================================
// End-to-end Results
// ============================================================================

#[test]
fn test_place_padded_example_process_backend() {
    let dir = tempdir().unwrap();
    let (a, w) = padded_example(&dir);
    mxpool()
        .args(["--policy", "place", "--once", "--log-dir"])
        .arg(dir.path())
        .arg(&a)
        .arg(&w)
        .assert()
        .success()
        .stdout(predicate::str::starts_with("R=[\n2 2 2 2 2 0 0 0\n0 0 0 0 0 0 0 0\n"));
}

#[test]
fn test_backends_agree() {
    let dir = tempdir().unwrap();
    let a = write(&dir, "A.txt", "1 2 3\n4 5 6\n7 8 9\n");
    let w1 = write(&dir, "W1.txt", "9 8 7\n6 5 4\n3 2 1\n");
    let w2 = write(&dir, "W2.txt", "-1 0 2\n0 3 0\n5 0 -4\n");

    let run = |backend: &str| {
        let output = mxpool()
            .args(["--backend", backend, "--dim", "3", "--once", "-f", "json", "--log-dir"])
            .arg(dir.path())
            .arg(&a)
            .arg(&w1)
            .arg(&w2)
            .output()
            .unwrap();
        assert!(output.status.success());
        json_of(&output)
    };

    let process = run("process");
    let thread = run("thread");
    assert_eq!(process["policy"], "history");
    assert_eq!(process["result"], thread["result"]);
    assert_eq!(
        process["result"][0]["matrix"],
        serde_json::json!([[30, 24, 18], [84, 69, 54], [138, 114, 90]])
    );
    assert_eq!(process["workers"].as_array().unwrap().len(), 6);
    assert_eq!(thread["workers"].as_array().unwrap().len(), 18);
}

#[test]
fn test_sum_policy_with_bias() {
    let dir = tempdir().unwrap();
    let a = write(&dir, "A.txt", "1 2\n3 4\n");
    let w1 = write(&dir, "W1.txt", "1 0\n0 1\n");
    let w2 = write(&dir, "W2.txt", "0 1\n1 0\n");
    let bias = write(&dir, "B.txt", "10\n");
    mxpool()
        .args(["--policy", "sum", "--dim", "2", "--once", "--bias"])
        .arg(&bias)
        .arg("--log-dir")
        .arg(dir.path())
        .arg(&a)
        .arg(&w1)
        .arg(&w2)
        .assert()
        .success()
        .stdout("Final rSum Matrix=[\n13 3\n7 7\n]\n");
}

#[test]
fn test_stream_history_keeps_order() {
    let dir = tempdir().unwrap();
    let w = write(&dir, "W.txt", "1 0\n0 1\n");
    let inputs: Vec<PathBuf> = (0..8)
        .map(|i| write(&dir, &format!("A{}.txt", i), &format!("{} 0\n0 {}\n", i, i)))
        .collect();
    let stdin = inputs[1..]
        .chunks(3)
        .map(|chunk| {
            chunk
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let output = mxpool()
        .args(["--dim", "2", "-f", "json", "--log-dir"])
        .arg(dir.path())
        .arg(&inputs[0])
        .arg(&w)
        .write_stdin(stdin)
        .output()
        .unwrap();
    assert!(output.status.success());

    let report = json_of(&output);
    assert_eq!(report["iterations"], 8);
    let blocks = report["result"].as_array().unwrap();
    for (i, block) in blocks.iter().enumerate() {
        assert_eq!(block["sequence"], i);
        assert_eq!(block["matrix"], serde_json::json!([[i, 0], [0, i]]));
    }

    for log in out_logs(dir.path()) {
        let positions: Vec<usize> = (0..8)
            .map(|i| log.find(&format!("input {}: ", i)).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }
}

#[test]
fn test_chained_sum_feeds_result_back() {
    let dir = tempdir().unwrap();
    let a = write(&dir, "A.txt", "1 2\n3 4\n");
    let w1 = write(&dir, "W1.txt", "1 0\n0 1\n");
    let w2 = write(&dir, "W2.txt", "0 1\n1 0\n");
    // Round 0: A·W1 + A·W2 = [3 3; 7 7]; round 1 doubles it
    mxpool()
        .args(["--policy", "sum", "--chain", "--dim", "2", "--log-dir"])
        .arg(dir.path())
        .arg(&a)
        .arg(&w1)
        .arg(&w2)
        .write_stdin(format!("{} {}\n", w1.display(), w2.display()))
        .assert()
        .success()
        .stdout("Final rSum Matrix=[\n6 6\n14 14\n]\n");

    // 4 workers per round, none sharing a sink
    assert_eq!(out_logs(dir.path()).len(), 8);
}

#[test]
fn test_plain_history_header() {
    let dir = tempdir().unwrap();
    let (a, w) = padded_example(&dir);
    mxpool()
        .args(["--dim", "3", "--log-dir"])
        .arg(dir.path())
        .arg(&a)
        .arg(&w)
        .write_stdin(format!("{}\n", a.display()))
        .assert()
        .success()
        .stdout(predicate::str::starts_with("rMatrix for 2 A matrices=[\n2 2 2\n"));
}

#[test]
fn test_designated_worker_only() {
    let dir = tempdir().unwrap();
    let a = write(&dir, "A.txt", "1 2\n3 4\n");
    let w = write(&dir, "W.txt", "1 0\n0 1\n");
    let output = mxpool()
        .args(["--policy", "place", "--dim", "2", "--once", "--only-worker", "1"])
        .args(["-f", "json", "--log-dir"])
        .arg(dir.path())
        .arg(&a)
        .arg(&w)
        .output()
        .unwrap();
    assert!(output.status.success());

    let report = json_of(&output);
    assert_eq!(report["result"], serde_json::json!([[0, 0], [3, 4]]));
    assert_eq!(report["unset_rows"], serde_json::json!([{ "row": 0 }]));
}

// ============================================================================
// Lifecycle Logs
// ============================================================================

#[test]
fn test_every_worker_has_one_start_and_one_exit_record() {
    let dir = tempdir().unwrap();
    let (a, w) = padded_example(&dir);
    mxpool()
        .args(["--dim", "3", "--log-dir"])
        .arg(dir.path())
        .arg(&a)
        .arg(&w)
        .arg(&w)
        .write_stdin(format!("{}\n", a.display()))
        .assert()
        .success();

    let logs = out_logs(dir.path());
    assert_eq!(logs.len(), 6);
    for log in logs {
        assert!(log.starts_with("Starting command "));
        assert_eq!(log.matches("Starting command").count(), 1);
        assert_eq!(log.matches("Finished child").count(), 1);
        assert!(log.find("Starting command") < log.find("Finished child"));
        assert!(log.ends_with("Exited with exitcode = 0\n"));
    }
}

#[test]
fn test_worker_startup_failure_does_not_fail_run() {
    let dir = tempdir().unwrap();
    let (a, _) = padded_example(&dir);
    // Opens as a file handle, but no worker can read it as a matrix
    let w = dir.path().join("W.d");
    std::fs::create_dir(&w).unwrap();

    for backend in ["process", "thread"] {
        let logs = tempdir().unwrap();
        mxpool()
            .args(["--backend", backend, "--dim", "2", "--once", "-q", "--log-dir"])
            .arg(logs.path())
            .arg(&a)
            .arg(&w)
            .assert()
            .success();

        let outs = out_logs(logs.path());
        assert!(!outs.is_empty());
        for log in outs {
            assert!(log.contains("Starting command"));
            assert!(log.ends_with("Exited with exitcode = 1\n"));
        }
    }
}

#[test]
fn test_one_worker_startup_failure_leaves_others_running() {
    let dir = tempdir().unwrap();
    let a = write(&dir, "A.txt", "1 2\n3 4\n");
    let good = write(&dir, "W.txt", "1 0\n0 1\n");
    let bad = dir.path().join("W.d");
    std::fs::create_dir(&bad).unwrap();

    let output = mxpool()
        .args(["--dim", "2", "--once", "-q", "-f", "json", "--log-dir"])
        .arg(dir.path())
        .arg(&a)
        .arg(&good)
        .arg(&bad)
        .output()
        .unwrap();
    assert!(output.status.success());

    let report = json_of(&output);
    let codes: Vec<i64> = report["workers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|w| {
            assert_eq!(w["disposition"]["kind"], "exited");
            w["disposition"]["value"].as_i64().unwrap()
        })
        .collect();
    assert_eq!(codes.iter().filter(|&&c| c == 0).count(), 2);
    assert_eq!(codes.iter().filter(|&&c| c == 1).count(), 2);

    assert_eq!(report["result"][0]["weight"], 0);
    assert_eq!(report["result"][0]["matrix"], serde_json::json!([[1, 2], [3, 4]]));
    assert_eq!(report["result"][1]["matrix"], serde_json::json!([[0, 0], [0, 0]]));
    let unset = report["unset_rows"].as_array().unwrap();
    assert_eq!(unset.len(), 2);
    assert!(unset.iter().all(|u| u["weight"] == 1));

    let logs = out_logs(dir.path());
    assert_eq!(logs.len(), 4);
    let failed = logs
        .iter()
        .filter(|log| log.ends_with("Exited with exitcode = 1\n"))
        .count();
    assert_eq!(failed, 2);
}

#[test]
fn test_killed_worker_is_recorded_and_run_continues() {
    let dir = tempdir().unwrap();
    let first = write(&dir, "A0.txt", "1 2\n3 4\n");
    let second = write(&dir, "A1.txt", "5 6\n7 8\n");
    let w = write(&dir, "W.txt", "1 0\n0 1\n");
    let config = RunConfig {
        input: first,
        weights: vec![w],
        bias: None,
        stream: true,
        chain: false,
        pool: PoolConfig {
            backend: Backend::Process,
            policy: MergePolicy::History,
            dim: 2,
            log_dir: dir.path().to_path_buf(),
            worker_exe: PathBuf::from(env!("CARGO_BIN_EXE_mxpool")),
            ..PoolConfig::default()
        },
    };

    let (read_end, write_end) = nix::unistd::pipe().unwrap();
    let run = std::thread::spawn(move || {
        coordinator::run(&config, BufReader::new(File::from(read_end)))
    });

    // Wait until both workers have answered the first item
    let deadline = Instant::now() + Duration::from_secs(30);
    let victim = loop {
        let sinks = out_sinks(dir.path());
        if sinks.len() == 2 && sinks.iter().all(|(_, log)| log.contains("input 0: ")) {
            let (stem, _) = sinks
                .iter()
                .find(|(_, log)| log.contains("input 0 row 1: "))
                .unwrap();
            break stem.clone();
        }
        assert!(Instant::now() < deadline, "workers never answered");
        std::thread::sleep(Duration::from_millis(20));
    };

    let pid: i32 = victim.parse().unwrap();
    kill(Pid::from_raw(pid), Signal::SIGKILL).unwrap();

    let mut feed = File::from(write_end);
    writeln!(feed, "{}", second.display()).unwrap();
    drop(feed);

    let report = run.join().unwrap().unwrap();
    for record in &report.workers {
        let expected = if record.worker.to_string() == victim {
            Disposition::Signaled(9)
        } else {
            Disposition::Exited(0)
        };
        assert_eq!(record.disposition, expected);
    }

    let log = std::fs::read_to_string(dir.path().join(format!("{}.out", victim))).unwrap();
    assert!(log.ends_with("Killed with signal 9\n"));

    let FinalState::History(blocks) = report.state else {
        panic!("Expected History");
    };
    assert_eq!(blocks[1].matrix.row(0), &[5, 6]);
    assert_eq!(
        report.unset_rows,
        vec![UnsetRow {
            sequence: Some(1),
            weight: Some(0),
            row: 1
        }]
    );
}
