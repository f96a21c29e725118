//! Build modules: named build units with their own scope, rules, dependency
//! edges and action graph.

use std::path::PathBuf;

use crate::eval::scope::Scope;
use crate::graph::Action;
use crate::parse::SourceLocation;
use crate::rules::RuleSet;

/// Index of a module in the session's module arena.
pub type ModuleId = usize;

/// A named build unit declared by `$(module ...)`.
///
/// `built` and `updated` are monotonic within one run: they flip from false
/// to true and are never reset until the session is discarded.
#[derive(Debug)]
pub struct Module {
  pub name: String,
  pub dir: PathBuf,
  /// Registered toolset name; empty until a declaration supplies one.
  pub toolset: String,
  /// Module kind string, owned by the toolset.
  pub kind: String,
  pub scope: Scope,
  pub rules: RuleSet,
  /// Root action for building this module, created by the toolset.
  pub action: Option<Action>,
  pub using: Vec<ModuleId>,
  pub used_by: Vec<ModuleId>,
  pub built: bool,
  pub updated: bool,
  pub location: Option<SourceLocation>,
}

impl Module {
  pub fn new(name: &str, dir: PathBuf, location: Option<SourceLocation>) -> Self {
    Module {
      name: name.to_string(),
      dir,
      toolset: String::new(),
      kind: String::new(),
      scope: Scope::new(),
      rules: RuleSet::default(),
      action: None,
      using: Vec::new(),
      used_by: Vec::new(),
      built: false,
      updated: false,
      location,
    }
  }
}

/// A module whose build was requested by `$(build ...)`, waiting for the
/// driver to create its actions once dependencies are resolved.
#[derive(Debug, Clone)]
pub struct PendingBuild {
  pub module: ModuleId,
  pub args: Vec<String>,
}
