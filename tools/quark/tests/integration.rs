//! Integration tests for the quark binary.
//!
//! Each test builds a throwaway project in a temporary directory, with `cp`
//! standing in for the compiler and `cat` for the linker, and drives the
//! binary as a subprocess.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

const CONFIG: &str = r#"
[compile]
command = "cp {input} {output}"

[link]
command = "cat {objects} > {output}"
settle-timeout-ms = 2000
"#;

/// `main.cc` includes `util.h`, implemented by `util.cc`.
fn write_project(root: &Path, config: &str) {
    fs::write(root.join("quark.toml"), config).unwrap();
    fs::write(root.join("main.cc"), "#include \"util.h\"\nint main() { return util(); } // ok\n").unwrap();
    fs::write(root.join("util.h"), "int util();\n").unwrap();
    fs::write(root.join("util.cc"), "#include \"util.h\"\nint util() { return 0; }\n").unwrap();
}

fn quark(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_quark"))
        .arg("-C")
        .arg(root)
        .args(args)
        .output()
        .expect("failed to execute quark")
}

fn describe(output: &Output) -> String {
    format!(
        "exit={:?}\nstdout:\n{}\nstderr:\n{}",
        output.status.code(),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn builds_then_reports_up_to_date() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path(), CONFIG);

    let first = quark(dir.path(), &["build", "-j", "2"]);
    assert!(first.status.success(), "first build failed: {}", describe(&first));
    let stdout = String::from_utf8_lossy(&first.stdout);
    assert!(stdout.contains("[ LAUNCHED main.cc on localhost ]"), "{}", describe(&first));
    assert!(stdout.contains("Build complete. (2 compiled, 1 linked, 0 up to date)"), "{}", describe(&first));

    let exe = dir.path().join("build/bin/main");
    let linked = fs::read_to_string(&exe).unwrap();
    assert!(linked.contains("int main()"));
    assert!(linked.contains("int util()"));
    assert!(dir.path().join("build/quark-manifest.json").exists());

    let second = quark(dir.path(), &["build", "-j", "2"]);
    assert!(second.status.success(), "second build failed: {}", describe(&second));
    let stdout = String::from_utf8_lossy(&second.stdout);
    assert!(!stdout.contains("LAUNCHED"), "{}", describe(&second));
    assert!(stdout.contains("(0 compiled, 0 linked, 1 up to date)"), "{}", describe(&second));
}

#[test]
fn compile_error_blocks_link_and_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = r#"
[compile]
command = "grep -q ok {input} && cp {input} {output} || (echo {input}:1: error: not ok >&2; exit 1)"

[link]
command = "cat {objects} > {output}"
"#;
    write_project(dir.path(), config);

    let output = quark(dir.path(), &["build", "-j", "1"]);
    assert!(!output.status.success(), "build unexpectedly succeeded: {}", describe(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("FAILED: util.cc"), "{}", describe(&output));
    assert!(stdout.contains(":1: error: not ok"), "{}", describe(&output));
    assert!(stdout.contains("NOT LINKED: main.cc (failed: util.cc)"), "{}", describe(&output));
    assert!(!dir.path().join("build/bin/main").exists());
    assert!(dir.path().join("build/obj/main.cc.o").exists());
}

#[test]
fn quiet_build_prints_only_summary() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path(), CONFIG);

    let output = quark(dir.path(), &["-q", "build", "main"]);
    assert!(output.status.success(), "{}", describe(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("LAUNCHED"), "{}", describe(&output));
    assert!(stdout.trim_end().ends_with("Build complete. (2 compiled, 1 linked, 0 up to date)"));
}

#[test]
fn deps_lists_resolution_without_building() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path(), CONFIG);

    let output = quark(dir.path(), &["deps", "main.cc"]);
    assert!(output.status.success(), "{}", describe(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("To compile:\n  main.cc\n  util.cc\n"), "{}", describe(&output));
    assert!(stdout.contains("main.cc: main.cc util.cc"), "{}", describe(&output));
    assert!(!dir.path().join("build/obj").exists());
}

#[test]
fn unknown_target_is_a_warning() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path(), CONFIG);

    let output = quark(dir.path(), &["build", "no_such_program", "main.cc"]);
    assert!(output.status.success(), "{}", describe(&output));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("warning: no_such_program: no such file or executable; skipped"),
        "{}",
        describe(&output)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Build complete. (2 compiled, 1 linked, 0 up to date)"), "{}", describe(&output));
}

#[test]
fn invalid_config_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path(), "[remote]\nmax-retries = 0\n");

    let output = quark(dir.path(), &["build"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("max-retries"), "{}", describe(&output));
}

#[test]
fn clean_removes_build_dir() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path(), CONFIG);
    fs::create_dir_all(dir.path().join("build/obj")).unwrap();

    let output = quark(dir.path(), &["clean"]);
    assert!(output.status.success(), "{}", describe(&output));
    assert!(!dir.path().join("build").exists());

    let output = quark(dir.path(), &["clean"]);
    assert!(String::from_utf8_lossy(&output.stdout).contains("Nothing to clean."));
}
