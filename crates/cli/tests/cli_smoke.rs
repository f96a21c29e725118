//! Smoke tests for the smelt binary.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn smelt() -> Command {
  Command::cargo_bin("smelt").unwrap()
}

#[test]
fn help_mentions_the_basics() {
  smelt()
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("--jobs"))
    .stdout(predicate::str::contains("--output"));
}

#[test]
fn empty_directory_succeeds_with_nothing_to_do() {
  let tmp = TempDir::new().unwrap();
  smelt()
    .arg("-C")
    .arg(tmp.path())
    .assert()
    .success()
    .stderr(predicate::str::contains("nothing to update"));
}

#[test]
fn builds_a_shell_module() {
  let tmp = TempDir::new().unwrap();
  fs::write(tmp.path().join("in.txt"), "hello\n").unwrap();
  fs::write(
    tmp.path().join(".smelt"),
    "$(module demo, shell, data)\n\
     me.sources = in.txt\n\
     me.command = cat {in} > {out}\n\
     $(build)\n",
  )
  .unwrap();

  smelt().arg("-C").arg(tmp.path()).assert().success();
  let out = tmp.path().join("smelt-out").join("demo");
  assert_eq!(fs::read_to_string(out).unwrap(), "hello\n");
}

#[test]
fn variable_overrides_reach_the_scripts() {
  let tmp = TempDir::new().unwrap();
  fs::write(tmp.path().join("in.txt"), "x\n").unwrap();
  fs::write(
    tmp.path().join(".smelt"),
    "$(module demo, shell, data)\n\
     me.sources = in.txt\n\
     me.command = echo $(GREETING) > {out}\n\
     $(build)\n",
  )
  .unwrap();

  smelt()
    .arg("-C")
    .arg(tmp.path())
    .arg("GREETING=bonjour")
    .assert()
    .success();
  let out = tmp.path().join("smelt-out").join("demo");
  assert_eq!(fs::read_to_string(out).unwrap().trim(), "bonjour");
}

#[test]
fn unknown_toolset_exits_with_a_coded_error() {
  let tmp = TempDir::new().unwrap();
  fs::write(tmp.path().join(".smelt"), "$(module demo, nosuch, data)\n").unwrap();

  smelt()
    .arg("-C")
    .arg(tmp.path())
    .assert()
    .failure()
    .stderr(predicate::str::contains("E011"))
    .stderr(predicate::str::contains("nosuch"));
}

#[test]
fn failing_recipe_exits_nonzero() {
  let tmp = TempDir::new().unwrap();
  fs::write(tmp.path().join(".smelt"), "broken :\n\t@exit 7\n").unwrap();

  smelt().arg("-C").arg(tmp.path()).assert().failure();
}

#[test]
fn dump_prints_the_module_graph() {
  let tmp = TempDir::new().unwrap();
  fs::write(tmp.path().join("in.txt"), "x\n").unwrap();
  fs::write(
    tmp.path().join(".smelt"),
    "$(module demo, shell, data)\n\
     me.sources = in.txt\n\
     me.command = cat {in} > {out}\n\
     $(build)\n",
  )
  .unwrap();

  smelt()
    .arg("-C")
    .arg(tmp.path())
    .arg("--dump")
    .assert()
    .success()
    .stdout(predicate::str::contains("\"demo\""))
    .stdout(predicate::str::contains("\"toolset\": \"shell\""));
}
