//! Make-style rules: `targets : prerequisites` plus recipe lines.
//!
//! Rules live in the namespace that declared them, module or global; the
//! first rule registered becomes the namespace's default goal. Recipe lines
//! are stored as parse nodes and expand when the rule runs, not when it is
//! declared.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fs;
use std::rc::Rc;
use std::time::SystemTime;

use tracing::{debug, info};

use crate::eval::{Context, EvalError};
use crate::graph::BuildError;
use crate::graph::command::system_shell;
use crate::parse::{NodeId, ScriptBuffer};

/// One parsed rule.
#[derive(Debug)]
pub struct Rule {
  pub targets: Vec<String>,
  pub prerequisites: Vec<String>,
  /// Recipe lines as deferred nodes, expanded at execution time.
  pub recipes: Vec<(Rc<ScriptBuffer>, NodeId)>,
  pub double_colon: bool,
}

/// The rules of one namespace, keyed by target.
#[derive(Debug, Default)]
pub struct RuleSet {
  rules: HashMap<String, Rc<Rule>>,
  goal: Option<String>,
}

impl RuleSet {
  /// Map each target of the rule; the first rule seen becomes the goal.
  pub fn insert(&mut self, rule: Rc<Rule>) {
    if self.goal.is_none() {
      self.goal = rule.targets.first().cloned();
    }
    for target in &rule.targets {
      self.rules.insert(target.clone(), rule.clone());
    }
  }

  pub fn find(&self, target: &str) -> Option<Rc<Rule>> {
    self.rules.get(target).cloned()
  }

  /// The default goal rule, when any rule was declared.
  pub fn goal(&self) -> Option<Rc<Rule>> {
    self.goal.as_deref().and_then(|g| self.find(g))
  }

  pub fn is_empty(&self) -> bool {
    self.rules.is_empty()
  }
}

/// Update a rule target by name against the global rule set.
pub fn update_target(ctx: &mut Context, target: &str) -> Result<bool, RuleUpdateError> {
  let Some(rule) = ctx.global_rules.find(target) else {
    return Err(RuleUpdateError::Build(BuildError::NoRule {
      target: target.to_string(),
    }));
  };
  let mut in_progress = HashSet::new();
  update_rule(ctx, &rule, &mut in_progress)
}

/// Errors from the rule updater: expansion failures or build failures.
#[derive(Debug, thiserror::Error)]
pub enum RuleUpdateError {
  #[error(transparent)]
  Eval(#[from] EvalError),
  #[error(transparent)]
  Build(#[from] BuildError),
}

impl RuleUpdateError {
  pub fn code(&self) -> i32 {
    match self {
      RuleUpdateError::Eval(e) => e.code(),
      RuleUpdateError::Build(e) => e.code(),
    }
  }
}

/// Update a rule: prerequisites that match other rules update first, then
/// the recipes run when any target is missing or older than a prerequisite.
pub fn update_rule(
  ctx: &mut Context,
  rule: &Rc<Rule>,
  in_progress: &mut HashSet<String>,
) -> Result<bool, RuleUpdateError> {
  for target in &rule.targets {
    // A target already on the stack means a rule cycle; treat it as done.
    if !in_progress.insert(target.clone()) {
      debug!(target = %target, "rule cycle, skipping");
      return Ok(false);
    }
  }

  let result = update_rule_inner(ctx, rule, in_progress);
  for target in &rule.targets {
    in_progress.remove(target);
  }
  result
}

fn update_rule_inner(
  ctx: &mut Context,
  rule: &Rc<Rule>,
  in_progress: &mut HashSet<String>,
) -> Result<bool, RuleUpdateError> {
  let mut newest_prerequisite: Option<SystemTime> = None;
  for prerequisite in &rule.prerequisites {
    if let Some(sub) = ctx.global_rules.find(prerequisite) {
      update_rule(ctx, &sub, in_progress)?;
    }
    match modified(prerequisite) {
      Some(m) => {
        if newest_prerequisite.is_none_or(|n| n < m) {
          newest_prerequisite = Some(m);
        }
      }
      None => {
        if ctx.global_rules.find(prerequisite).is_none() {
          return Err(RuleUpdateError::Build(BuildError::TargetNotFound {
            target: prerequisite.clone(),
          }));
        }
        // A phony prerequisite rule leaves no file behind; that is fine.
      }
    }
  }

  let stale = rule.targets.iter().any(|t| match modified(t) {
    None => true,
    Some(m) => newest_prerequisite.is_some_and(|n| m < n),
  });
  if !stale {
    return Ok(false);
  }

  for (buf, id) in &rule.recipes {
    let line = ctx.expand_node(buf, *id)?;
    run_recipe_line(&line)?;
  }
  Ok(true)
}

/// Run one recipe line through the shell. A leading `@` suppresses echoing.
pub fn run_recipe_line(line: &str) -> Result<(), BuildError> {
  let (line, echo) = match line.strip_prefix('@') {
    Some(rest) => (rest, false),
    None => (line, true),
  };
  let line = line.trim();
  if line.is_empty() {
    return Ok(());
  }
  if echo {
    println!("{line}");
  } else {
    info!(recipe = %line, "running");
  }

  let (shell, flag) = system_shell();
  let status = std::process::Command::new(shell)
    .arg(flag)
    .arg(line)
    .status()
    .map_err(|e| BuildError::Spawn {
      program: shell.to_string(),
      source: e,
    })?;
  if !status.success() {
    return Err(BuildError::RecipeFailed {
      line: line.to_string(),
      code: status.code(),
    });
  }
  Ok(())
}

fn modified(path: &str) -> Option<SystemTime> {
  fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;
  use crate::driver::BuildOptions;
  use crate::parse::parse_script;

  fn context_with(source: &str) -> Context {
    let mut ctx = Context::new(BuildOptions::default());
    let buf = parse_script("test.smelt", source).unwrap();
    ctx.process_buffer(&buf).unwrap();
    ctx
  }

  #[test]
  fn goal_is_the_first_rule() {
    let ctx = context_with("first : \n\t@true\nsecond : \n\t@true\n");
    assert_eq!(ctx.global_rules.goal().unwrap().targets, ["first"]);
  }

  #[test]
  fn missing_target_runs_recipes() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("out.txt");
    let mut ctx = context_with(&format!("{} : \n\t@echo made > {}\n", out.display(), out.display()));
    let ran = update_target(&mut ctx, &out.display().to_string()).unwrap();
    assert!(ran);
    assert!(out.exists());
  }

  #[test]
  fn fresh_target_does_not_rerun() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("src.txt");
    let out = tmp.path().join("out.txt");
    std::fs::write(&src, "s").unwrap();
    std::fs::write(&out, "o").unwrap();

    let mut ctx = context_with(&format!(
      "{} : {}\n\t@echo again > {}\n",
      out.display(),
      src.display(),
      out.display()
    ));
    let ran = update_target(&mut ctx, &out.display().to_string()).unwrap();
    assert!(!ran);
  }

  #[test]
  fn prerequisite_rules_update_first() {
    let tmp = TempDir::new().unwrap();
    let mid = tmp.path().join("mid.txt");
    let out = tmp.path().join("out.txt");
    let mut ctx = context_with(&format!(
      "{out} : {mid}\n\t@cat {mid} > {out}\n{mid} : \n\t@echo mid > {mid}\n",
      out = out.display(),
      mid = mid.display()
    ));
    assert!(update_target(&mut ctx, &out.display().to_string()).unwrap());
    assert!(mid.exists());
    assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "mid");
  }

  #[test]
  fn missing_prerequisite_without_rule_is_fatal() {
    let mut ctx = context_with("out.txt : nothere.txt\n\t@true\n");
    let err = update_target(&mut ctx, "out.txt").unwrap_err();
    assert!(matches!(
      err,
      RuleUpdateError::Build(BuildError::TargetNotFound { .. })
    ));
  }

  #[test]
  fn no_rule_for_goal_is_fatal() {
    let mut ctx = context_with("");
    let err = update_target(&mut ctx, "ghost").unwrap_err();
    assert!(matches!(
      err,
      RuleUpdateError::Build(BuildError::NoRule { .. })
    ));
  }

  #[test]
  fn failing_recipe_is_fatal() {
    let mut ctx = context_with("out : \n\t@exit 9\n");
    let err = update_target(&mut ctx, "out").unwrap_err();
    assert!(matches!(
      err,
      RuleUpdateError::Build(BuildError::RecipeFailed { code: Some(9), .. })
    ));
  }

  #[test]
  fn recipes_expand_at_run_time() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("out.txt");
    // The variable is reassigned after the rule is declared; the recipe must
    // see the later value.
    let mut ctx = context_with(&format!(
      "msg = early\n{out} : \n\t@echo $(msg) > {out}\nmsg = late\n",
      out = out.display()
    ));
    update_target(&mut ctx, &out.display().to_string()).unwrap();
    assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "late");
  }

  #[test]
  fn rule_cycles_terminate() {
    let mut ctx = context_with("a : b\n\t@true\nb : a\n\t@true\n");
    // Both rules are phony and cyclic; the updater must terminate.
    let result = update_target(&mut ctx, "a");
    assert!(result.is_ok());
  }
}
