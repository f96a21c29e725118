//! The action graph and its incremental update algorithm.
//!
//! An [`Action`] is one node of the build graph: the targets it produces, the
//! prerequisite actions it depends on, and a [`Recipe`]. Staleness is purely
//! filesystem-timestamp based: a target is stale when it is missing or
//! strictly older than a prerequisite target.
//!
//! A dynamic recipe owns its own target discovery: the command reports the
//! current output set and whether it still needs updating, which is how steps
//! whose output names are only knowable after running participate in the
//! incremental walk.

pub mod command;

use std::fs;
use std::path::Path;
use std::time::SystemTime;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Errors raised while updating the action graph or running commands.
#[derive(Debug, Error)]
pub enum BuildError {
  #[error("`{target}` not found")]
  TargetNotFound { target: String },

  #[error("`{target}` was not built")]
  TargetNotBuilt { target: String },

  #[error("prerequisites {targets:?} still require updating")]
  PrerequisiteStillStale { targets: Vec<String> },

  #[error("targets {targets:?} still stale after execution")]
  StillStaleAfterExecution { targets: Vec<String> },

  #[error("no command to update `{target}`")]
  NoCommand { target: String },

  #[error("failed to start `{program}`: {source}")]
  Spawn {
    program: String,
    source: std::io::Error,
  },

  #[error("command failed ({code:?}): {cmd}")]
  CmdFailed { cmd: String, code: Option<i32> },

  #[error("bad target pattern: {0}")]
  Pattern(#[from] regex::Error),

  #[error("recipe failed ({code:?}): {line}")]
  RecipeFailed { line: String, code: Option<i32> },

  #[error("no rule to update `{target}`")]
  NoRule { target: String },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

impl BuildError {
  pub fn code(&self) -> i32 {
    match self {
      BuildError::TargetNotFound { .. } => 31,
      BuildError::TargetNotBuilt { .. } => 32,
      BuildError::PrerequisiteStillStale { .. } => 33,
      BuildError::StillStaleAfterExecution { .. } => 34,
      BuildError::NoCommand { .. } => 35,
      BuildError::Spawn { .. } => 36,
      BuildError::CmdFailed { .. } => 37,
      BuildError::Pattern(_) => 38,
      BuildError::RecipeFailed { .. } => 39,
      BuildError::NoRule { .. } => 40,
      BuildError::Io(_) => 41,
    }
  }
}

/// A command executed by an action while updating its targets.
pub trait Command {
  /// Run the command for the given stale targets, with the prerequisite
  /// paths as inputs. Returns whether any work was performed.
  fn execute(&mut self, targets: &[String], prerequisites: &[String]) -> Result<bool, BuildError>;
}

/// A command whose output set is only knowable by asking it.
pub trait DynamicCommand: Command {
  /// Report the current target set and whether it still requires updating.
  fn targets(&self, prerequisites: &[Action]) -> Result<(Vec<String>, bool), BuildError>;
}

/// How an action produces its targets; fixed at construction time.
pub enum Recipe {
  /// No command: a pure source leaf whose declared targets must exist.
  Source,
  /// A command with statically declared targets.
  Static(Box<dyn Command>),
  /// A command that discovers its own targets.
  Dynamic(Box<dyn DynamicCommand>),
}

impl std::fmt::Debug for Recipe {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Recipe::Source => f.write_str("Source"),
      Recipe::Static(_) => f.write_str("Static(..)"),
      Recipe::Dynamic(_) => f.write_str("Dynamic(..)"),
    }
  }
}

/// What one update pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
  /// Whether the action executed its command.
  pub updated: bool,
  /// Concrete paths the action produced.
  pub targets: Vec<String>,
}

/// One build-graph node.
#[derive(Debug)]
pub struct Action {
  pub targets: Vec<String>,
  pub prerequisites: Vec<Action>,
  pub recipe: Recipe,
}

impl Action {
  /// A source leaf: no command, the target must already exist on disk.
  pub fn source(target: impl Into<String>) -> Self {
    Action {
      targets: vec![target.into()],
      prerequisites: Vec::new(),
      recipe: Recipe::Source,
    }
  }

  pub fn new(target: impl Into<String>, command: Box<dyn Command>) -> Self {
    Action {
      targets: vec![target.into()],
      prerequisites: Vec::new(),
      recipe: Recipe::Static(command),
    }
  }

  pub fn dynamic(target: impl Into<String>, command: Box<dyn DynamicCommand>) -> Self {
    Action {
      targets: vec![target.into()],
      prerequisites: Vec::new(),
      recipe: Recipe::Dynamic(command),
    }
  }

  pub fn with_prerequisites(mut self, prerequisites: Vec<Action>) -> Self {
    self.prerequisites = prerequisites;
    self
  }

  /// Incrementally update this action.
  ///
  /// Prerequisites update first, post-order. The whole action is forced when
  /// any prerequisite performed work or a dynamic recipe reports itself
  /// stale; otherwise only the individually missing or outdated targets are
  /// requested from the command.
  pub fn update(&mut self) -> Result<UpdateOutcome, BuildError> {
    let (targets, targets_need_update) = match &self.recipe {
      Recipe::Dynamic(c) => c.targets(&self.prerequisites)?,
      _ => (self.targets.clone(), false),
    };

    let mut mtimes: Vec<Option<SystemTime>> = Vec::with_capacity(targets.len());
    let mut missing: Vec<usize> = Vec::new();
    for (n, target) in targets.iter().enumerate() {
      match modified(target) {
        Some(m) => mtimes.push(Some(m)),
        None => {
          mtimes.push(None);
          missing.push(n);
        }
      }
    }

    let mut updated_prerequisites = 0usize;
    let mut prerequisite_paths: Vec<String> = Vec::new();
    let mut outdated: Vec<usize> = Vec::new();
    for p in &mut self.prerequisites {
      let outcome = p.update()?;
      if outcome.updated {
        prerequisite_paths.extend(outcome.targets);
        updated_prerequisites += 1;
        continue;
      }
      if let Recipe::Dynamic(pc) = &p.recipe {
        let (paths, still_stale) = pc.targets(&p.prerequisites)?;
        if still_stale {
          return Err(BuildError::PrerequisiteStillStale { targets: paths });
        }
        prerequisite_paths.extend(paths);
      } else {
        prerequisite_paths.extend(p.targets.iter().cloned());
        for pt in &p.targets {
          let pm = modified(pt).ok_or_else(|| BuildError::TargetNotFound { target: pt.clone() })?;
          for (n, m) in mtimes.iter().enumerate() {
            if let Some(m) = m
              && *m < pm
            {
              outdated.push(n);
            }
          }
        }
      }
    }

    if matches!(self.recipe, Recipe::Source) {
      if let Some(&n) = missing.first() {
        return Err(BuildError::TargetNotFound {
          target: targets[n].clone(),
        });
      }
      return Ok(UpdateOutcome::default());
    }

    if updated_prerequisites > 0 || targets_need_update {
      debug!(targets = ?targets, "forcing update");
      return self.execute(&targets, &prerequisite_paths);
    }

    let mut request = missing;
    request.extend(outdated);
    request.sort_unstable();
    request.dedup();
    if request.is_empty() {
      trace!(targets = ?targets, "up to date");
      return Ok(UpdateOutcome::default());
    }
    let subset: Vec<String> = request.into_iter().map(|n| targets[n].clone()).collect();
    debug!(targets = ?subset, "updating stale targets");
    self.execute(&subset, &prerequisite_paths)
  }

  /// Run the command for the requested targets and verify the result.
  fn execute(
    &mut self,
    targets: &[String],
    prerequisites: &[String],
  ) -> Result<UpdateOutcome, BuildError> {
    let Action {
      targets: declared,
      prerequisites: children,
      recipe,
    } = self;

    match recipe {
      Recipe::Source => Ok(UpdateOutcome::default()),

      Recipe::Static(command) => {
        if !command.execute(targets, prerequisites)? {
          return Ok(UpdateOutcome::default());
        }
        // Every declared target must exist after a forced execution.
        let mut produced = Vec::with_capacity(declared.len());
        for target in declared.iter() {
          if modified(target).is_none() {
            return Err(BuildError::TargetNotBuilt {
              target: target.clone(),
            });
          }
          produced.push(target.clone());
        }
        Ok(UpdateOutcome {
          updated: true,
          targets: produced,
        })
      }

      Recipe::Dynamic(command) => {
        if !command.execute(targets, prerequisites)? {
          return Ok(UpdateOutcome::default());
        }
        // The action is satisfied only once the command stops reporting
        // itself stale.
        let (produced, still_stale) = command.targets(children)?;
        if still_stale {
          return Err(BuildError::StillStaleAfterExecution { targets: produced });
        }
        Ok(UpdateOutcome {
          updated: true,
          targets: produced,
        })
      }
    }
  }
}

fn modified(path: &str) -> Option<SystemTime> {
  fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Build one action per source file through a name/command transform, each
/// with the source as a leaf prerequisite.
pub fn source_transform_actions(
  sources: &[String],
  transform: impl Fn(&str) -> Option<(String, Box<dyn Command>)>,
) -> Result<Vec<Action>, BuildError> {
  let mut actions = Vec::new();
  for src in sources {
    let Some((name, command)) = transform(src) else {
      continue;
    };
    if name == *src {
      return Err(BuildError::NoCommand {
        target: src.clone(),
      });
    }
    actions.push(Action::new(name, command).with_prerequisites(vec![Action::source(src.clone())]));
  }
  Ok(actions)
}

/// Scan `dir` for files matching `pattern` and count, per match, how many
/// prerequisites make it outdated. This is how a dynamic command answers
/// "what are my outputs and am I stale" without statically known filenames.
pub fn compute_inter_targets(
  dir: &Path,
  pattern: &str,
  prerequisites: &[Action],
) -> Result<(Vec<String>, usize, Vec<usize>), BuildError> {
  let re = Regex::new(pattern)?;
  let mut targets = Vec::new();
  let mut outdated_counts = Vec::new();
  let mut outdated_total = 0usize;

  for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
    if !entry.file_type().is_file() {
      continue;
    }
    let path = entry.path().to_string_lossy().into_owned();
    if !re.is_match(&path) {
      continue;
    }
    let target_mtime = entry.metadata().ok().and_then(|m| m.modified().ok());
    let count = count_outdated(target_mtime, prerequisites)?;
    outdated_total += count;
    targets.push(path);
    outdated_counts.push(count);
  }
  Ok((targets, outdated_total, outdated_counts))
}

/// The already-known-targets variant of [`compute_inter_targets`]: missing
/// targets count as outdated.
pub fn compute_known_inter_targets(
  targets: &[String],
  prerequisites: &[Action],
) -> Result<(usize, Vec<usize>), BuildError> {
  let mut outdated_counts = Vec::with_capacity(targets.len());
  let mut outdated_total = 0usize;
  for target in targets {
    let count = match modified(target) {
      None => 1,
      mtime => count_outdated(mtime, prerequisites)?,
    };
    outdated_total += count;
    outdated_counts.push(count);
  }
  Ok((outdated_total, outdated_counts))
}

fn count_outdated(
  target_mtime: Option<SystemTime>,
  prerequisites: &[Action],
) -> Result<usize, BuildError> {
  let mut count = 0;
  for p in prerequisites {
    if let Recipe::Dynamic(pc) = &p.recipe {
      let (_, still_stale) = pc.targets(&p.prerequisites)?;
      if still_stale {
        count += 1;
      }
    } else {
      for t in &p.targets {
        let pm = modified(t).ok_or_else(|| BuildError::TargetNotFound { target: t.clone() })?;
        if let Some(m) = target_mtime
          && m < pm
        {
          count += 1;
        }
      }
    }
  }
  Ok(count)
}
