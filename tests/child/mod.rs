//! Re-run a single test of the current test binary in a child process.
//!
//! Fatal paths abort the whole process, so tests exercising them run their
//! body in a child and assert on how it died.

#![allow(dead_code)]

use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Output};

const CHILD_ENV: &str = "AZNIX_TEST_CHILD";

/// True inside the child spawned for test `name`.
pub fn is_child(name: &str) -> bool {
    std::env::var(CHILD_ENV).as_deref() == Ok(name)
}

/// Run test `name` alone in a child process and collect its output.
pub fn run(name: &str) -> Output {
    let exe = std::env::current_exe().expect("test binary path");
    Command::new(exe)
        .args([name, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, name)
        .output()
        .expect("spawn child test process")
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

/// Assert the child died from SIGABRT with `needle` in its stderr.
pub fn assert_aborted_with(output: &Output, needle: &str) {
    let stderr = stderr(output);
    assert_eq!(
        output.status.signal(),
        Some(libc::SIGABRT),
        "child did not abort: {:?}\nstderr:\n{}",
        output.status,
        stderr
    );
    assert!(
        stderr.contains(needle),
        "child stderr lacks {:?}:\n{}",
        needle,
        stderr
    );
}
