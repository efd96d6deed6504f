//! CLI contract tests.

use assert_cmd::Command;

#[test]
fn help_lists_primary_subcommands() {
    let output = Command::cargo_bin("forcequit")
        .expect("binary built")
        .arg("--help")
        .output()
        .expect("runs");
    assert!(output.status.success());
    let help = String::from_utf8_lossy(&output.stdout);
    for sub in ["list", "classify", "kill", "sweep", "status", "watch", "restart", "helper"] {
        assert!(help.contains(sub), "help should mention '{sub}'");
    }
}

#[test]
fn kill_rejects_unknown_mode() {
    Command::cargo_bin("forcequit")
        .expect("binary built")
        .args(["kill", "123", "--mode", "nuclear"])
        .assert()
        .failure();
}

#[test]
fn kill_requires_a_pid() {
    Command::cargo_bin("forcequit")
        .expect("binary built")
        .arg("kill")
        .assert()
        .failure();
}
