//! End-to-end scenarios run through the CLI binary, exercising the
//! executor, substitution, generators, tokens, and fibers together the
//! way a real embedding script would.

use std::process::Command;
use std::time::Instant;

fn run(script: &str) -> (String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_pawscript"))
        .arg("-c")
        .arg(script)
        .output()
        .expect("failed to run pawscript binary");
    (String::from_utf8_lossy(&output.stdout).to_string(), output.status.success())
}

#[test]
fn brace_substitution_runs_nested_command() {
    let (stdout, status) = run("echo {add 2, 3}");
    assert_eq!(stdout, "5\n");
    assert!(status);
}

#[test]
fn macro_definition_and_invocation() {
    let (stdout, _) = run("macro greet, (echo \"hi $1\"); greet \"world\"");
    assert_eq!(stdout, "hi world\n");
}

#[test]
fn msleep_blocks_sequencing_until_resolved() {
    let (stdout, _) = run("msleep 10; echo done");
    assert_eq!(stdout, "done\n");
}

#[test]
fn generator_yields_then_exhausts() {
    let (stdout, _) = run(
        "macro g, (yield 1; yield 2); \
         set x, {generator g}; \
         echo {resume ~x}; \
         echo {resume ~x}; \
         echo {resume ~x}",
    );
    assert_eq!(stdout, "1\n2\n2\n");
}

#[test]
fn for_loop_counts_inclusive_range() {
    let (stdout, status) = run("for 1, 3, i, (echo ~i)");
    assert_eq!(stdout, "1\n2\n3\n");
    assert!(status);
}

#[test]
fn brace_groups_in_one_argument_evaluate_in_parallel() {
    // spec.md §8: two brace expressions each sleeping 50ms must finish
    // within ~80ms wall-clock, not 100ms -- proof the coordinator actually
    // runs sibling braces concurrently rather than one after another.
    let start = Instant::now();
    let (stdout, status) = run("echo {msleep 50; add 1, 1}-{msleep 50; add 2, 2}");
    let elapsed = start.elapsed();
    assert_eq!(stdout, "2-4\n");
    assert!(status);
    assert!(elapsed.as_millis() < 80, "parallel braces took {elapsed:?}, expected well under 100ms");
}

#[test]
fn fiber_bubbles_become_orphans_after_wait_all() {
    let (stdout, _) = run(
        "fiber f1, (msleep 20; bubble \"x\", 1); \
         fiber_wait_all; \
         set r, {bubble_orphans \"x\"}; \
         echo ~r",
    );
    assert_eq!(stdout, "(1)\n");
}
