//! The build driver.
//!
//! One [`Context`] is the whole session: constructed at build start, passed
//! by reference through discovery, evaluation and updating, and discarded at
//! build end, so repeated builds in one process never share hidden state.
//!
//! Failure policy: a failing module aborts only its dependent branch;
//! independent modules continue, and the run reports non-zero overall when
//! anything failed.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::discover::discover_scripts;
use crate::eval::{Context, EvalError};
use crate::graph::BuildError;
use crate::module::ModuleId;
use crate::parse::ParseError;
use crate::parse::parse_bytes;
use crate::rules::{self, RuleUpdateError};

/// Session options, mostly fed from the command line.
#[derive(Debug, Clone)]
pub struct BuildOptions {
  /// Root directory for script discovery.
  pub directory: PathBuf,
  /// Where toolsets place build outputs; defaults to the module directory.
  pub output_dir: Option<PathBuf>,
  /// Skip version-control metadata during discovery.
  pub ignore_vcs: bool,
  /// Requested parallelism for command execution. Recorded for toolsets;
  /// the reference driver updates serially.
  pub jobs: usize,
  /// Warn when an undefined variable is expanded.
  pub warn_undefined: bool,
}

impl Default for BuildOptions {
  fn default() -> Self {
    BuildOptions {
      directory: PathBuf::from("."),
      output_dir: None,
      ignore_vcs: true,
      jobs: 1,
      warn_undefined: false,
    }
  }
}

/// Fatal driver errors; everything funnels through this one type at the
/// entry point.
#[derive(Debug, Error)]
pub enum DriverError {
  #[error(transparent)]
  Parse(#[from] ParseError),

  #[error(transparent)]
  Eval(#[from] EvalError),

  #[error(transparent)]
  Build(#[from] BuildError),

  #[error("module dependency cycle through `{name}`")]
  ModuleCycle { name: String },
}

impl DriverError {
  pub fn code(&self) -> i32 {
    match self {
      DriverError::Parse(e) => e.code(),
      DriverError::Eval(e) => e.code(),
      DriverError::Build(e) => e.code(),
      DriverError::ModuleCycle { .. } => 51,
    }
  }
}

impl From<RuleUpdateError> for DriverError {
  fn from(e: RuleUpdateError) -> Self {
    match e {
      RuleUpdateError::Eval(e) => DriverError::Eval(e),
      RuleUpdateError::Build(e) => DriverError::Build(e),
    }
  }
}

/// What a build run did.
#[derive(Debug, Default)]
pub struct BuildReport {
  /// Scripts processed successfully.
  pub scripts: usize,
  /// Scripts that failed to read or parse; siblings still processed.
  pub script_failures: Vec<(PathBuf, String)>,
  /// Modules whose actions were created.
  pub built: Vec<String>,
  /// Target paths produced by action updates.
  pub updated_targets: Vec<String>,
  /// Modules or goals that failed, with the reason.
  pub failed: Vec<(String, String)>,
}

impl BuildReport {
  pub fn success(&self) -> bool {
    self.script_failures.is_empty() && self.failed.is_empty()
  }
}

/// Discover, evaluate and update. Goals name global rule targets or modules;
/// with no goals the default goal rule runs, or every module updates.
pub fn build(ctx: &mut Context, goals: &[String]) -> Result<BuildReport, DriverError> {
  let mut report = BuildReport::default();

  let root = ctx.options.directory.clone();
  let scripts = discover_scripts(&root, ctx.options.ignore_vcs);
  debug!(count = scripts.len(), root = %root.display(), "discovered scripts");

  for path in scripts {
    let bytes = match fs::read(&path) {
      Ok(b) => b,
      Err(e) => {
        warn!(path = %path.display(), error = %e, "cannot read script");
        report.script_failures.push((path, e.to_string()));
        continue;
      }
    };
    let buf = match parse_bytes(&path.to_string_lossy(), bytes) {
      Ok(b) => b,
      Err(e) => {
        // Syntax errors abort this script only.
        warn!("{e}");
        report.script_failures.push((path, e.to_string()));
        continue;
      }
    };
    ctx.process_buffer(&buf)?;
    report.scripts += 1;
  }

  check_cycles(ctx)?;

  let mut failed: HashSet<ModuleId> = HashSet::new();
  while let Some(pending) = ctx.pending.pop_front() {
    build_module(ctx, pending.module, &pending.args, &mut failed, &mut report);
  }

  if goals.is_empty() {
    if ctx.global_rules.is_empty() {
      update_modules(ctx, &mut failed, &mut report);
    } else if let Some(goal) = ctx.global_rules.goal() {
      // A default goal rule takes over the whole run.
      let target = goal.targets[0].clone();
      run_goal(ctx, &target, &mut failed, &mut report);
    }
  } else {
    for goal in goals {
      run_goal(ctx, goal, &mut failed, &mut report);
    }
  }

  Ok(report)
}

fn run_goal(
  ctx: &mut Context,
  goal: &str,
  failed: &mut HashSet<ModuleId>,
  report: &mut BuildReport,
) {
  if ctx.global_rules.find(goal).is_some() {
    match rules::update_target(ctx, goal) {
      Ok(ran) => {
        if ran {
          report.updated_targets.push(goal.to_string());
        }
      }
      Err(e) => report.failed.push((goal.to_string(), e.to_string())),
    }
    return;
  }
  if let Some(id) = ctx.module_id(goal) {
    if build_module(ctx, id, &[], failed, report) {
      update_module(ctx, id, failed, report);
    }
    return;
  }
  report
    .failed
    .push((goal.to_string(), "no such rule or module".to_string()));
}

/// Reject dependency cycles before building starts.
fn check_cycles(ctx: &Context) -> Result<(), DriverError> {
  let mut graph: DiGraph<ModuleId, ()> = DiGraph::new();
  let mut nodes = HashMap::new();
  for &id in ctx.module_order() {
    nodes.insert(id, graph.add_node(id));
  }
  for &id in ctx.module_order() {
    for &dep in &ctx.module(id).using {
      graph.add_edge(nodes[&dep], nodes[&id], ());
    }
  }
  toposort(&graph, None)
    .map(|_| ())
    .map_err(|cycle| DriverError::ModuleCycle {
      name: ctx.module(graph[cycle.node_id()]).name.clone(),
    })
}

/// Depth-first module build: every dependency must report built before the
/// toolset creates this module's actions.
fn build_module(
  ctx: &mut Context,
  id: ModuleId,
  args: &[String],
  failed: &mut HashSet<ModuleId>,
  report: &mut BuildReport,
) -> bool {
  if ctx.module(id).built {
    return true;
  }
  if failed.contains(&id) {
    return false;
  }

  let using = ctx.module(id).using.clone();
  let mut deps_ok = true;
  for dep in using {
    if !build_module(ctx, dep, &[], failed, report) {
      deps_ok = false;
    }
  }

  let name = ctx.module(id).name.clone();
  if !deps_ok {
    fail_module(ctx, id, failed, report, "dependencies failed");
    return false;
  }

  let toolset_name = ctx.module(id).toolset.clone();
  if toolset_name.is_empty() {
    fail_module(ctx, id, failed, report, "no toolset");
    return false;
  }
  let Some(toolset) = ctx.toolset(&toolset_name) else {
    fail_module(ctx, id, failed, report, "toolset not registered");
    return false;
  };

  debug!(module = %name, toolset = %toolset_name, "creating actions");
  let prev = ctx.current_module();
  ctx.set_current_module(Some(id));
  let ok = toolset.create_actions(ctx, id, args);
  ctx.set_current_module(prev);

  if !ok {
    fail_module(ctx, id, failed, report, "toolset did not create actions");
    return false;
  }
  ctx.module_mut(id).built = true;
  report.built.push(name);
  true
}

fn fail_module(
  ctx: &Context,
  id: ModuleId,
  failed: &mut HashSet<ModuleId>,
  report: &mut BuildReport,
  reason: &str,
) {
  if failed.insert(id) {
    let name = ctx.module(id).name.clone();
    warn!(module = %name, reason, "module failed");
    report.failed.push((name, reason.to_string()));
  }
}

/// Update every module in declaration order, dependencies first.
fn update_modules(ctx: &mut Context, failed: &mut HashSet<ModuleId>, report: &mut BuildReport) {
  for id in ctx.module_order().to_vec() {
    update_module(ctx, id, failed, report);
  }
}

fn update_module(
  ctx: &mut Context,
  id: ModuleId,
  failed: &mut HashSet<ModuleId>,
  report: &mut BuildReport,
) -> bool {
  let using = ctx.module(id).using.clone();
  let mut deps_ok = true;
  for dep in using {
    if !update_module(ctx, dep, failed, report) {
      deps_ok = false;
    }
  }

  if failed.contains(&id) {
    return false;
  }
  if ctx.module(id).updated {
    return true;
  }
  if !deps_ok {
    fail_module(ctx, id, failed, report, "dependencies failed");
    return false;
  }

  // Monotonic: one attempt per run, never reset.
  ctx.module_mut(id).updated = true;

  let name = ctx.module(id).name.clone();
  let mut action = ctx.module_mut(id).action.take();
  let result = match &mut action {
    Some(a) => a.update(),
    None => {
      debug!(module = %name, "no action");
      Ok(Default::default())
    }
  };
  ctx.module_mut(id).action = action;

  match result {
    Ok(outcome) => {
      if outcome.updated {
        info!(module = %name, targets = ?outcome.targets, "updated");
      } else {
        debug!(module = %name, "nothing to do");
      }
      report.updated_targets.extend(outcome.targets);
      true
    }
    Err(e) => {
      failed.insert(id);
      report.failed.push((name.clone(), e.to_string()));
      warn!(module = %name, error = %e, "update failed");
      false
    }
  }
}

/// Serializable view of the resolved module graph, for inspection output.
#[derive(Debug, Serialize)]
pub struct ModuleSummary {
  pub name: String,
  pub dir: String,
  pub toolset: String,
  pub kind: String,
  pub using: Vec<String>,
  pub built: bool,
  pub updated: bool,
}

#[derive(Debug, Serialize)]
pub struct SessionSummary {
  pub modules: Vec<ModuleSummary>,
}

pub fn summarize(ctx: &Context) -> SessionSummary {
  let modules = ctx
    .module_order()
    .iter()
    .map(|&id| {
      let m = ctx.module(id);
      ModuleSummary {
        name: m.name.clone(),
        dir: m.dir.display().to_string(),
        toolset: m.toolset.clone(),
        kind: m.kind.clone(),
        using: m.using.iter().map(|&u| ctx.module(u).name.clone()).collect(),
        built: m.built,
        updated: m.updated,
      }
    })
    .collect();
  SessionSummary { modules }
}
