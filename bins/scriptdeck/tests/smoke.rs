use assert_cmd::Command;
use predicates::prelude::*;

fn deck(home: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("scriptdeck").unwrap();
    cmd.arg("--home").arg(home);
    cmd
}

fn add(home: &std::path::Path, args: &[&str]) -> String {
    let out = deck(home).args(["jobs", "add"]).args(args).assert().success();
    String::from_utf8(out.get_output().stdout.clone()).unwrap().trim().to_string()
}

#[test]
fn empty_deck_lists_nothing() {
    let home = tempfile::tempdir().unwrap();
    deck(home.path())
        .args(["jobs", "list"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
    assert!(home.path().join("config.toml").exists());
}

#[test]
fn added_job_is_listed_and_removed() {
    let home = tempfile::tempdir().unwrap();
    let id = add(home.path(), &["--name", "build", "--file", "build.sh", "--cron", "*/5 * * * *"]);
    assert!(!id.is_empty());

    deck(home.path())
        .args(["jobs", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("{id}\tbuild\tfile\tbuild.sh\t*/5 * * * *\tenabled")));

    deck(home.path()).args(["jobs", "rm", &id]).assert().success();
    deck(home.path())
        .args(["jobs", "list", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(id.as_str()).not());
}

#[test]
fn bad_cron_still_saves() {
    let home = tempfile::tempdir().unwrap();
    deck(home.path())
        .args(["jobs", "add", "--name", "x", "--command", "true", "--cron", "sometimes"])
        .assert()
        .success()
        .stderr(predicate::str::contains("saved without a timer"));
    deck(home.path())
        .args(["jobs", "list"])
        .assert()
        .stdout(predicate::str::contains("sometimes"));
}

#[test]
fn bad_cron_with_blank_id_prints_the_assigned_id() {
    let home = tempfile::tempdir().unwrap();
    let out = deck(home.path())
        .args(["jobs", "add", "--name", "x", "--command", "true", "--cron", "sometimes", "--id", ""])
        .assert()
        .success()
        .stderr(predicate::str::contains("saved without a timer"));
    let id = String::from_utf8(out.get_output().stdout.clone()).unwrap().trim().to_string();
    assert!(!id.is_empty());

    deck(home.path())
        .args(["jobs", "show", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("sometimes"));
}

#[test]
fn target_is_required() {
    let home = tempfile::tempdir().unwrap();
    deck(home.path()).args(["jobs", "add", "--name", "x"]).assert().failure();
}

#[test]
fn removing_unknown_job_fails() {
    let home = tempfile::tempdir().unwrap();
    deck(home.path())
        .args(["jobs", "rm", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("job nope not found"));
}

#[cfg(unix)]
#[test]
fn run_streams_output_and_exit_code() {
    let home = tempfile::tempdir().unwrap();
    deck(home.path())
        .args(["prefs", "set", "--shell", "sh", "--load-shell-config", "false"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"preferredShell\": \"sh\""));

    let ok = add(home.path(), &["--name", "hi", "--command", "echo hello"]);
    deck(home.path()).args(["run", &ok]).assert().success().stdout("hello\n");

    let bad = add(home.path(), &["--name", "bad", "--command", "sh -c false"]);
    deck(home.path()).args(["run", &bad]).assert().code(1);
}

#[test]
fn unsupported_script_is_reported() {
    let home = tempfile::tempdir().unwrap();
    let id = add(home.path(), &["--name", "notes", "--file", "notes.txt"]);
    deck(home.path())
        .args(["run", &id])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unsupported file type"));
}
