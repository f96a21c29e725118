//! Script evaluation.
//!
//! The [`Context`] is the session value threaded through the whole build: it
//! owns the global scope, the module arena and registry, the toolset registry
//! and the pending-build queue. It performs name resolution and recursive,
//! on-demand expansion of call nodes, invoking the builtin table.
//!
//! Name resolution walks, in priority order: the pseudo-names (`$`, `me`),
//! a module prefix (`me.` routes to the current module's scope), the builtin
//! table, then the global scope. Compound names like `a.b.c` and
//! `toolset:name` split into a scope selector plus ordered parts.

pub mod builtins;
pub mod scope;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::driver::BuildOptions;
use crate::graph::command::system_shell;
use crate::module::{Module, ModuleId, PendingBuild};
use crate::parse::{NodeId, NodeKind, ScriptBuffer, SourceLocation};
use crate::rules::{Rule, RuleSet};
use crate::toolset::Toolset;

use scope::{Definition, Fragment, Scope, Value};

/// Errors raised while evaluating scripts. These carry a numeric code and
/// surface at the driver entry point.
#[derive(Debug, Error)]
pub enum EvalError {
  #[error("toolset `{name}` unknown")]
  UnknownToolset { name: String },

  #[error("toolset `{name}` already registered")]
  DuplicateToolset { name: String },

  #[error("module `{name}` already declared as ({toolset}, {kind})")]
  ModuleConflict {
    name: String,
    toolset: String,
    kind: String,
  },

  #[error("no module defined")]
  NoModule,

  #[error("no toolset for module `{name}`")]
  NoToolset { name: String },

  #[error("no namespace for `{name}`")]
  NoNamespace { name: String },

  #[error("shell capture failed ({status}): {cmd}")]
  ShellCapture { cmd: String, status: String },

  #[error("expression error: {message}")]
  Expr { message: String },

  #[error("unexpected {kind} node in expansion")]
  UnexpectedNode { kind: String },
}

impl EvalError {
  pub fn code(&self) -> i32 {
    match self {
      EvalError::UnknownToolset { .. } => 11,
      EvalError::DuplicateToolset { .. } => 12,
      EvalError::ModuleConflict { .. } => 13,
      EvalError::NoModule => 14,
      EvalError::NoToolset { .. } => 15,
      EvalError::NoNamespace { .. } => 16,
      EvalError::ShellCapture { .. } => 17,
      EvalError::Expr { .. } => 18,
      EvalError::UnexpectedNode { .. } => 19,
    }
  }
}

/// Which scope a name resolved into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NsRef {
  Global,
  Module(ModuleId),
  Toolset(String),
}

/// The evaluation context and session state.
pub struct Context {
  pub options: BuildOptions,

  globals: Scope,
  pub(crate) global_rules: RuleSet,

  modules: Vec<Module>,
  module_ids: HashMap<String, ModuleId>,
  order: Vec<ModuleId>,
  pub(crate) pending: VecDeque<PendingBuild>,
  current: Option<ModuleId>,

  toolsets: HashMap<String, Rc<dyn Toolset>>,
  toolset_scopes: HashMap<String, Scope>,

  /// Script currently being processed, for locations and module directories.
  cur_buf: Option<Rc<ScriptBuffer>>,
  cur_loc: Option<SourceLocation>,
}

impl Context {
  pub fn new(options: BuildOptions) -> Self {
    Context {
      options,
      globals: Scope::new(),
      global_rules: RuleSet::default(),
      modules: Vec::new(),
      module_ids: HashMap::new(),
      order: Vec::new(),
      pending: VecDeque::new(),
      current: None,
      toolsets: HashMap::new(),
      toolset_scopes: HashMap::new(),
      cur_buf: None,
      cur_loc: None,
    }
  }

  // ---- registries ----

  /// Register a toolset under a unique name. Duplicate registration is fatal.
  pub fn register_toolset(&mut self, name: &str, toolset: Rc<dyn Toolset>) -> Result<(), EvalError> {
    if self.toolsets.contains_key(name) {
      return Err(EvalError::DuplicateToolset { name: name.into() });
    }
    self.toolsets.insert(name.to_string(), toolset);
    self.toolset_scopes.insert(name.to_string(), Scope::new());
    Ok(())
  }

  pub fn toolset(&self, name: &str) -> Option<Rc<dyn Toolset>> {
    self.toolsets.get(name).cloned()
  }

  pub fn toolset_scope_mut(&mut self, name: &str) -> Option<&mut Scope> {
    self.toolset_scopes.get_mut(name)
  }

  pub fn module(&self, id: ModuleId) -> &Module {
    &self.modules[id]
  }

  pub fn module_mut(&mut self, id: ModuleId) -> &mut Module {
    &mut self.modules[id]
  }

  pub fn module_id(&self, name: &str) -> Option<ModuleId> {
    self.module_ids.get(name).copied()
  }

  /// Modules in declaration order.
  pub fn module_order(&self) -> &[ModuleId] {
    &self.order
  }

  pub fn module_count(&self) -> usize {
    self.modules.len()
  }

  pub fn current_module(&self) -> Option<ModuleId> {
    self.current
  }

  pub fn set_current_module(&mut self, id: Option<ModuleId>) {
    self.current = id;
  }

  pub(crate) fn globals_mut(&mut self) -> &mut Scope {
    &mut self.globals
  }

  pub fn current_location(&self) -> Option<SourceLocation> {
    self.cur_loc.clone()
  }

  fn script_dir(&self) -> PathBuf {
    self
      .cur_buf
      .as_ref()
      .and_then(|b| Path::new(&b.name).parent().map(Path::to_path_buf))
      .filter(|p| !p.as_os_str().is_empty())
      .unwrap_or_else(|| PathBuf::from("."))
  }

  /// Create or reuse a module declaration. Redeclaration may add missing
  /// toolset or kind information but never contradict it.
  pub fn declare_module(
    &mut self,
    name: &str,
    toolset_name: &str,
    kind: &str,
  ) -> Result<ModuleId, EvalError> {
    if !toolset_name.is_empty() && !self.toolsets.contains_key(toolset_name) {
      return Err(EvalError::UnknownToolset {
        name: toolset_name.into(),
      });
    }

    let id = match self.module_ids.get(name) {
      Some(&id) => {
        let m = &self.modules[id];
        let toolset_conflict =
          !m.toolset.is_empty() && !toolset_name.is_empty() && m.toolset != toolset_name;
        let kind_conflict = !m.kind.is_empty() && !kind.is_empty() && m.kind != kind;
        if toolset_conflict || kind_conflict {
          return Err(EvalError::ModuleConflict {
            name: name.into(),
            toolset: m.toolset.clone(),
            kind: m.kind.clone(),
          });
        }
        id
      }
      None => self.insert_module(name),
    };

    // A declaration owns the module's directory; a stub created by use()
    // had only borrowed the using script's location.
    let dir = self.script_dir();
    let m = &mut self.modules[id];
    if m.toolset.is_empty() {
      m.toolset = toolset_name.to_string();
    }
    if m.kind.is_empty() {
      m.kind = kind.to_string();
    }
    m.dir = dir.clone();
    m.scope
      .set_readonly("dir", Value::text(dir.display().to_string()));
    Ok(id)
  }

  /// Get or create a stub module, as `$(use ...)` does for modules that have
  /// not been declared yet.
  pub fn stub_module(&mut self, name: &str) -> ModuleId {
    match self.module_ids.get(name) {
      Some(&id) => id,
      None => self.insert_module(name),
    }
  }

  fn insert_module(&mut self, name: &str) -> ModuleId {
    let dir = self.script_dir();
    let mut module = Module::new(name, dir.clone(), self.cur_loc.clone());
    module.scope.set_readonly("name", Value::text(name));
    module
      .scope
      .set_readonly("dir", Value::text(dir.display().to_string()));
    let id = self.modules.len();
    self.modules.push(module);
    self.module_ids.insert(name.to_string(), id);
    self.order.push(id);
    id
  }

  // ---- script processing ----

  /// Process a parsed script's top-level nodes: assignments mutate scopes,
  /// rules register, calls run for their side effects.
  pub fn process_buffer(&mut self, buf: &Rc<ScriptBuffer>) -> Result<(), EvalError> {
    self.cur_buf = Some(buf.clone());
    self.current = None;
    for i in 0..buf.roots.len() {
      let root = buf.roots[i];
      if buf.node(root).kind == NodeKind::Comment {
        continue;
      }
      self.process_node(buf, root)?;
    }
    Ok(())
  }

  fn process_node(&mut self, buf: &Rc<ScriptBuffer>, id: NodeId) -> Result<(), EvalError> {
    let node = buf.node(id);
    self.cur_loc = Some(buf.location(node.pos));

    match node.kind {
      NodeKind::Comment => Ok(()),

      NodeKind::Call => {
        let value = self.node_items(buf, id)?;
        let text = self.expand_value(&value)?;
        if !text.trim().is_empty() {
          warn!(location = %buf.location(node.pos), text = %text.trim(), "ignored top-level expansion");
        }
        Ok(())
      }

      NodeKind::ImmediateText => {
        let value = self.node_items(buf, id)?;
        let text = self.expand_value(&value)?;
        if !text.trim().is_empty() {
          warn!(location = %buf.location(node.pos), text = %text.trim(), "stray text");
        }
        Ok(())
      }

      NodeKind::DefineDeferred => {
        let (scoped, prefix, parts) = self.expand_name_node(buf, node.children[0])?;
        self.set_with_details(scoped, &prefix, &parts, Value::node(buf.clone(), node.children[1]))
      }

      NodeKind::DefineQuestioned => {
        let (scoped, prefix, parts) = self.expand_name_node(buf, node.children[0])?;
        let current = self.call_with_details(scoped, &prefix, &parts, &[])?;
        if self.expand_value(&current)?.is_empty() {
          self.set_with_details(
            scoped,
            &prefix,
            &parts,
            Value::node(buf.clone(), node.children[1]),
          )?;
        }
        Ok(())
      }

      NodeKind::DefineSingleColoned | NodeKind::DefineDoubleColoned => {
        let (scoped, prefix, parts) = self.expand_name_node(buf, node.children[0])?;
        let value = self.node_items(buf, node.children[1])?;
        let text = self.expand_value(&value)?;
        self.set_with_details(scoped, &prefix, &parts, Value::text(text))
      }

      NodeKind::DefineNot => {
        let (scoped, prefix, parts) = self.expand_name_node(buf, node.children[0])?;
        let value = self.node_items(buf, node.children[1])?;
        let cmdline = self.expand_value(&value)?;
        let output = shell_capture(&cmdline)?;
        self.set_with_details(scoped, &prefix, &parts, Value::text(output))
      }

      NodeKind::DefineAppend => {
        let (scoped, prefix, parts) = self.expand_name_node(buf, node.children[0])?;
        self.append_with_details(
          scoped,
          &prefix,
          &parts,
          &[Fragment::Node(buf.clone(), node.children[1])],
        )
      }

      NodeKind::RuleSingleColoned | NodeKind::RuleDoubleColoned => {
        let targets_text = self.expand_node(buf, node.children[0])?;
        let targets = split_words(&targets_text);
        if targets.is_empty() {
          warn!(location = %buf.location(node.pos), "rule with no targets");
          return Ok(());
        }
        let prerequisites = split_words(&self.expand_node(buf, node.children[1])?);

        let mut recipes = Vec::new();
        for &c in &node.children[2..] {
          match buf.node(c).kind {
            NodeKind::Recipes => {
              for &r in &buf.node(c).children {
                if buf.node(r).kind == NodeKind::Recipe {
                  recipes.push((buf.clone(), r));
                }
              }
            }
            NodeKind::Recipe => recipes.push((buf.clone(), c)),
            _ => {}
          }
        }

        let rule = Rc::new(Rule {
          targets,
          prerequisites,
          recipes,
          double_colon: node.kind == NodeKind::RuleDoubleColoned,
        });
        match self.current {
          Some(m) => self.modules[m].rules.insert(rule),
          None => self.global_rules.insert(rule),
        }
        Ok(())
      }

      other => Err(EvalError::UnexpectedNode {
        kind: format!("{other:?}"),
      }),
    }
  }

  // ---- expansion ----

  /// Expand a value: fragments expand individually and non-empty results
  /// join with a single space.
  pub fn expand_value(&mut self, value: &Value) -> Result<String, EvalError> {
    let mut out = String::new();
    for fragment in value.fragments() {
      let s = self.expand_fragment(fragment)?;
      if s.is_empty() {
        continue;
      }
      if !out.is_empty() {
        out.push(' ');
      }
      out.push_str(&s);
    }
    Ok(out)
  }

  fn expand_fragment(&mut self, fragment: &Fragment) -> Result<String, EvalError> {
    match fragment {
      Fragment::Text(s) => Ok(s.clone()),
      Fragment::Node(buf, id) => {
        let buf = buf.clone();
        let value = self.node_items(&buf, *id)?;
        self.expand_value(&value)
      }
    }
  }

  /// Expand one node to text.
  pub fn expand_node(&mut self, buf: &Rc<ScriptBuffer>, id: NodeId) -> Result<String, EvalError> {
    let value = self.node_items(buf, id)?;
    self.expand_value(&value)
  }

  /// Turn a node into an (unexpanded where possible) value.
  pub fn node_items(&mut self, buf: &Rc<ScriptBuffer>, id: NodeId) -> Result<Value, EvalError> {
    let node = buf.node(id);
    match node.kind {
      NodeKind::Escape => {
        let escaped = buf.text[node.pos + 1..].chars().next();
        Ok(match escaped {
          Some('\n') => Value::text(" "),
          _ => Value::text("#"),
        })
      }

      NodeKind::Call => {
        let args: Vec<Value> = node.children[1..]
          .iter()
          .map(|&a| Value::node(buf.clone(), a))
          .collect();
        let (scoped, prefix, parts) = self.expand_name_node(buf, node.children[0])?;
        let prev = self.cur_loc.replace(buf.location(node.pos));
        let result = self.call_with_details(scoped, &prefix, &parts, &args);
        self.cur_loc = prev;
        result
      }

      NodeKind::Name
      | NodeKind::Arg
      | NodeKind::Recipe
      | NodeKind::DeferredText
      | NodeKind::Targets
      | NodeKind::Prerequisites
      | NodeKind::ImmediateText => {
        if node.children.is_empty() {
          Ok(Value::text(buf.str_of(id)))
        } else {
          let (text, _, _) = self.multipart(buf, id)?;
          Ok(Value::text(text))
        }
      }

      other => Err(EvalError::UnexpectedNode {
        kind: format!("{other:?}"),
      }),
    }
  }

  /// Rebuild a node's text, expanding embedded calls and marking name prefix
  /// and part boundaries.
  fn multipart(
    &mut self,
    buf: &Rc<ScriptBuffer>,
    id: NodeId,
  ) -> Result<(String, Option<usize>, Vec<usize>), EvalError> {
    let node = buf.node(id);
    let mut text = String::new();
    let mut prefix_end = None;
    let mut part_bounds = Vec::new();
    let mut pos = node.pos;

    for &c in &node.children {
      let child = buf.node(c);
      if pos < child.pos {
        text.push_str(&buf.text[pos..child.pos]);
      }
      pos = child.end;
      match child.kind {
        NodeKind::NamePrefix => {
          text.push(':');
          prefix_end = Some(text.len());
        }
        NodeKind::NamePart => {
          text.push('.');
          part_bounds.push(text.len());
        }
        _ => {
          let value = self.node_items(buf, c)?;
          text.push_str(&self.expand_value(&value)?);
        }
      }
    }
    if pos < node.end {
      text.push_str(&buf.text[pos..node.end]);
    }
    Ok((text, prefix_end, part_bounds))
  }

  /// Split a name node into (scoped, prefix, parts), expanding any calls
  /// embedded in the name.
  fn expand_name_node(
    &mut self,
    buf: &Rc<ScriptBuffer>,
    id: NodeId,
  ) -> Result<(bool, String, Vec<String>), EvalError> {
    let (text, prefix_end, bounds) = self.multipart(buf, id)?;
    let (scoped, prefix, start) = match prefix_end {
      Some(e) => (true, text[..e - 1].to_string(), e),
      None => (false, String::new(), 0),
    };
    let mut parts = Vec::new();
    let mut p = start;
    for b in bounds.into_iter().filter(|&b| b > start) {
      parts.push(text[p..b - 1].to_string());
      p = b;
    }
    parts.push(text[p..].to_string());
    Ok((scoped, prefix, parts))
  }

  /// Split a plain name string into (scoped, prefix, parts).
  pub(crate) fn expand_name_string(name: &str) -> (bool, String, Vec<String>) {
    let (scoped, prefix, rest) = match name.split_once(':') {
      Some((p, r)) => (true, p.to_string(), r),
      None => (false, String::new(), name),
    };
    let parts = rest.split('.').map(str::to_string).collect();
    (scoped, prefix, parts)
  }

  // ---- resolution ----

  /// Resolve and expand a call by name.
  pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, EvalError> {
    let (scoped, prefix, parts) = Self::expand_name_string(name);
    self.call_with_details(scoped, &prefix, &parts, args)
  }

  /// Convenience: call with no arguments and expand to text.
  pub fn expand_call(&mut self, name: &str) -> Result<String, EvalError> {
    let value = self.call(name, &[])?;
    self.expand_value(&value)
  }

  /// Call a module-scoped name with another module current.
  pub fn call_in_module(
    &mut self,
    module: ModuleId,
    name: &str,
    args: &[Value],
  ) -> Result<Value, EvalError> {
    let prev = self.current;
    self.current = Some(module);
    let result = self.call(&format!("me.{name}"), args);
    self.current = prev;
    result
  }

  /// Expand a module-scope variable to text.
  pub fn module_var(&mut self, module: ModuleId, name: &str) -> Result<String, EvalError> {
    let value = self.call_in_module(module, name, &[])?;
    self.expand_value(&value)
  }

  pub(crate) fn call_with_details(
    &mut self,
    scoped: bool,
    prefix: &str,
    parts: &[String],
    args: &[Value],
  ) -> Result<Value, EvalError> {
    let me_parts;
    let parts = if !scoped && parts.len() == 1 {
      match parts[0].as_str() {
        "$" => return Ok(Value::text("$")),
        "me" => {
          // The bare module pseudo-variable names the current module.
          me_parts = vec!["me".to_string(), "name".to_string()];
          &me_parts[..]
        }
        sym => {
          if let Some(builtin) = builtins::lookup(sym) {
            return builtin(self, args);
          }
          parts
        }
      }
    } else {
      parts
    };

    let Some(ns) = self.find_namespace(scoped, prefix, parts) else {
      return Ok(Value::empty());
    };
    let sym = parts.last().expect("name with no parts");
    match self.scope_ref(&ns).and_then(|s| s.get(sym)) {
      Some(d) => Ok(d.value.clone()),
      None => {
        if self.options.warn_undefined {
          warn!(name = %join_name(scoped, prefix, parts), "undefined variable");
        }
        Ok(Value::empty())
      }
    }
  }

  /// Assign a value to a (possibly compound) name.
  pub fn set(&mut self, name: &str, value: Value) -> Result<(), EvalError> {
    let (scoped, prefix, parts) = Self::expand_name_string(name);
    self.set_with_details(scoped, &prefix, &parts, value)
  }

  pub(crate) fn set_with_details(
    &mut self,
    scoped: bool,
    prefix: &str,
    parts: &[String],
    value: Value,
  ) -> Result<(), EvalError> {
    let Some(ns) = self.find_namespace(scoped, prefix, parts) else {
      return Err(EvalError::NoNamespace {
        name: join_name(scoped, prefix, parts),
      });
    };
    let sym = parts.last().expect("name with no parts").clone();
    let location = self.cur_loc.clone();
    match self.scope_mut_ref(&ns) {
      Some(scope) => {
        if !scope.set(&sym, value, location) {
          warn!(name = %sym, "assignment to readonly variable ignored");
        }
        Ok(())
      }
      None => Err(EvalError::NoNamespace {
        name: join_name(scoped, prefix, parts),
      }),
    }
  }

  /// `+=`: append lazily onto a deferred base, expand now onto an immediate
  /// base, plain-assign when nothing is there yet.
  pub(crate) fn append_with_details(
    &mut self,
    scoped: bool,
    prefix: &str,
    parts: &[String],
    fragments: &[Fragment],
  ) -> Result<(), EvalError> {
    enum Base {
      Absent,
      Readonly,
      Deferred,
      Immediate,
    }
    let base = match self.define_ref(scoped, prefix, parts) {
      None => Base::Absent,
      Some(d) if d.readonly => Base::Readonly,
      Some(d) if d.value.starts_deferred() => Base::Deferred,
      Some(_) => Base::Immediate,
    };

    match base {
      Base::Readonly => {
        warn!(name = %join_name(scoped, prefix, parts), "append to readonly variable ignored");
        Ok(())
      }
      Base::Deferred => {
        let d = self
          .define_mut(scoped, prefix, parts)
          .expect("definition vanished");
        for fragment in fragments {
          d.value.push(fragment.clone());
        }
        Ok(())
      }
      Base::Immediate => {
        let mut text = String::new();
        for fragment in fragments {
          let s = self.expand_fragment(fragment)?;
          if s.is_empty() {
            continue;
          }
          if !text.is_empty() {
            text.push(' ');
          }
          text.push_str(&s);
        }
        let d = self
          .define_mut(scoped, prefix, parts)
          .expect("definition vanished");
        d.value.push(Fragment::Text(text));
        Ok(())
      }
      Base::Absent => {
        let mut value = Value::empty();
        for fragment in fragments {
          value.push(fragment.clone());
        }
        self.set_with_details(scoped, prefix, parts, value)
      }
    }
  }

  fn define_ref(&self, scoped: bool, prefix: &str, parts: &[String]) -> Option<&Definition> {
    let ns = self.find_namespace(scoped, prefix, parts)?;
    let sym = parts.last()?;
    self.scope_ref(&ns)?.get(sym)
  }

  fn define_mut(
    &mut self,
    scoped: bool,
    prefix: &str,
    parts: &[String],
  ) -> Option<&mut Definition> {
    let ns = self.find_namespace(scoped, prefix, parts)?;
    let sym = parts.last()?.clone();
    self.scope_mut_ref(&ns)?.get_mut(&sym)
  }

  /// Select the scope a name lives in. Returns None for unresolvable scopes,
  /// which callers treat as an empty expansion.
  pub(crate) fn find_namespace(
    &self,
    scoped: bool,
    prefix: &str,
    parts: &[String],
  ) -> Option<NsRef> {
    let mut ns: Option<NsRef> = None;
    if scoped {
      if self.toolsets.contains_key(prefix) {
        ns = Some(NsRef::Toolset(prefix.to_string()));
      } else {
        warn!(prefix, "undefined toolset prefix");
        return None;
      }
    }
    if parts.len() == 1 && ns.is_none() {
      return Some(NsRef::Global);
    }

    let mut walked = String::new();
    for (i, part) in parts[..parts.len() - 1].iter().enumerate() {
      if !walked.is_empty() {
        walked.push('.');
      }
      walked.push_str(part);

      ns = match ns {
        Some(cur) => self.sub_namespace(&cur, part),
        None if i == 0 => match part.as_str() {
          "me" => match self.current {
            Some(id) => Some(NsRef::Module(id)),
            None => {
              debug!("`me` used with no current module");
              None
            }
          },
          "~" => match self.current.map(|id| &self.modules[id]) {
            Some(m) if !m.toolset.is_empty() && self.toolsets.contains_key(&m.toolset) => {
              Some(NsRef::Toolset(m.toolset.clone()))
            }
            _ => {
              debug!("`~` used with no bound toolset");
              None
            }
          },
          name => self.module_ids.get(name).map(|&id| NsRef::Module(id)),
        },
        None => None,
      };

      if ns.is_none() {
        debug!(scope = %walked, "undefined scope");
        return None;
      }
    }
    ns
  }

  /// Walk one level down from a namespace. Module sub-namespaces are modules
  /// registered under the dotted name.
  fn sub_namespace(&self, ns: &NsRef, part: &str) -> Option<NsRef> {
    match ns {
      NsRef::Module(id) => {
        let qualified = format!("{}.{}", self.modules[*id].name, part);
        self.module_ids.get(&qualified).map(|&m| NsRef::Module(m))
      }
      _ => None,
    }
  }

  fn scope_ref(&self, ns: &NsRef) -> Option<&Scope> {
    match ns {
      NsRef::Global => Some(&self.globals),
      NsRef::Module(id) => Some(&self.modules[*id].scope),
      NsRef::Toolset(name) => self.toolset_scopes.get(name),
    }
  }

  pub(crate) fn scope_mut_ref(&mut self, ns: &NsRef) -> Option<&mut Scope> {
    match ns {
      NsRef::Global => Some(&mut self.globals),
      NsRef::Module(id) => Some(&mut self.modules[*id].scope),
      NsRef::Toolset(name) => self.toolset_scopes.get_mut(name),
    }
  }
}

/// Run a `!=` value through the shell, capturing stdout with trailing
/// newlines trimmed.
fn shell_capture(cmdline: &str) -> Result<String, EvalError> {
  let (shell, flag) = system_shell();
  let output = std::process::Command::new(shell)
    .arg(flag)
    .arg(cmdline)
    .output()
    .map_err(|e| EvalError::ShellCapture {
      cmd: cmdline.to_string(),
      status: e.to_string(),
    })?;
  if !output.status.success() {
    return Err(EvalError::ShellCapture {
      cmd: cmdline.to_string(),
      status: match output.status.code() {
        Some(code) => format!("exit {code}"),
        None => "terminated".to_string(),
      },
    });
  }
  let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
  while text.ends_with('\n') || text.ends_with('\r') {
    text.pop();
  }
  Ok(text)
}

/// Whitespace-separated words of an expanded string.
pub(crate) fn split_words(text: &str) -> Vec<String> {
  text.split_whitespace().map(str::to_string).collect()
}

fn join_name(scoped: bool, prefix: &str, parts: &[String]) -> String {
  let joined = parts.join(".");
  if scoped {
    format!("{prefix}:{joined}")
  } else {
    joined
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::parse::parse_script;

  fn context() -> Context {
    Context::new(BuildOptions::default())
  }

  fn process(ctx: &mut Context, source: &str) {
    let buf = parse_script("test.smelt", source).unwrap();
    ctx.process_buffer(&buf).unwrap();
  }

  #[test]
  fn deferred_value_tracks_reassignment() {
    let mut ctx = context();
    process(&mut ctx, "a = 1\nb = $(a)\n");
    assert_eq!(ctx.expand_call("b").unwrap(), "1");
    process(&mut ctx, "a = 2\n");
    assert_eq!(ctx.expand_call("b").unwrap(), "2");
  }

  #[test]
  fn immediate_value_is_captured_once() {
    let mut ctx = context();
    process(&mut ctx, "a = 1\nb := $(a)\na = 2\n");
    assert_eq!(ctx.expand_call("b").unwrap(), "1");
    assert_eq!(ctx.expand_call("a").unwrap(), "2");
  }

  #[test]
  fn immediate_value_is_idempotent() {
    let mut ctx = context();
    process(&mut ctx, "n = 0\nx := v$(n)\n");
    let first = ctx.expand_call("x").unwrap();
    for _ in 0..3 {
      assert_eq!(ctx.expand_call("x").unwrap(), first);
    }
  }

  #[test]
  fn append_onto_deferred_base() {
    let mut ctx = context();
    process(&mut ctx, "x = foo\nx += bar\n");
    assert_eq!(ctx.expand_call("x").unwrap(), "foo bar");
  }

  #[test]
  fn append_onto_immediate_base() {
    let mut ctx = context();
    process(&mut ctx, "x := foo\nx += bar\n");
    assert_eq!(ctx.expand_call("x").unwrap(), "foo bar");
  }

  #[test]
  fn append_stays_lazy_on_deferred_base() {
    let mut ctx = context();
    process(&mut ctx, "a = 1\nx = v\nx += $(a)\na = 2\n");
    assert_eq!(ctx.expand_call("x").unwrap(), "v 2");
  }

  #[test]
  fn append_without_base_assigns() {
    let mut ctx = context();
    process(&mut ctx, "x += solo\n");
    assert_eq!(ctx.expand_call("x").unwrap(), "solo");
  }

  #[test]
  fn conditional_assignment_is_first_wins() {
    let mut ctx = context();
    process(&mut ctx, "x ?= a\nx ?= b\n");
    assert_eq!(ctx.expand_call("x").unwrap(), "a");
  }

  #[test]
  fn conditional_assignment_fills_empty() {
    let mut ctx = context();
    process(&mut ctx, "x =\nx ?= filled\n");
    assert_eq!(ctx.expand_call("x").unwrap(), "filled");
  }

  #[test]
  fn module_scope_resolves_empty_without_module() {
    let mut ctx = context();
    assert_eq!(ctx.expand_call("me.foo").unwrap(), "");
  }

  #[test]
  fn module_scope_resolves_inside_module() {
    let mut ctx = context();
    let id = ctx.stub_module("demo");
    ctx.set_current_module(Some(id));
    ctx.set("me.foo", Value::text("V")).unwrap();
    assert_eq!(ctx.expand_call("me.foo").unwrap(), "V");
    ctx.set_current_module(None);
    assert_eq!(ctx.expand_call("me.foo").unwrap(), "");
  }

  #[test]
  fn module_scope_reached_by_module_name() {
    let mut ctx = context();
    let id = ctx.stub_module("demo");
    ctx.set_current_module(Some(id));
    ctx.set("me.foo", Value::text("V")).unwrap();
    ctx.set_current_module(None);
    assert_eq!(ctx.expand_call("demo.foo").unwrap(), "V");
  }

  #[test]
  fn dotted_submodule_namespace_walk() {
    let mut ctx = context();
    ctx.stub_module("top");
    let sub = ctx.stub_module("top.sub");
    ctx.set_current_module(Some(sub));
    ctx.set("me.v", Value::text("deep")).unwrap();
    ctx.set_current_module(None);
    assert_eq!(ctx.expand_call("top.sub.v").unwrap(), "deep");
  }

  #[test]
  fn me_pseudo_variable_names_current_module() {
    let mut ctx = context();
    let id = ctx.stub_module("demo");
    ctx.set_current_module(Some(id));
    assert_eq!(ctx.expand_call("me").unwrap(), "demo");
  }

  #[test]
  fn dollar_pseudo_name() {
    let mut ctx = context();
    process(&mut ctx, "x = $$\n");
    assert_eq!(ctx.expand_call("x").unwrap(), "$");
  }

  #[test]
  fn readonly_assignment_is_ignored() {
    let mut ctx = context();
    let id = ctx.stub_module("demo");
    ctx.set_current_module(Some(id));
    ctx.set("me.name", Value::text("other")).unwrap();
    assert_eq!(ctx.expand_call("me.name").unwrap(), "demo");
  }

  #[test]
  fn toolset_prefix_routes_to_toolset_scope() {
    let mut ctx = context();
    ctx
      .register_toolset("fake", Rc::new(crate::toolset::BasicToolset))
      .unwrap();
    ctx.set("fake:flags", Value::text("-O2")).unwrap();
    assert_eq!(ctx.expand_call("fake:flags").unwrap(), "-O2");
  }

  #[test]
  fn unknown_prefix_expands_empty() {
    let mut ctx = context();
    assert_eq!(ctx.expand_call("nosuch:flags").unwrap(), "");
  }

  #[test]
  fn duplicate_toolset_registration_is_fatal() {
    let mut ctx = context();
    ctx
      .register_toolset("dup", Rc::new(crate::toolset::BasicToolset))
      .unwrap();
    let err = ctx
      .register_toolset("dup", Rc::new(crate::toolset::BasicToolset))
      .unwrap_err();
    assert!(matches!(err, EvalError::DuplicateToolset { .. }));
  }

  #[test]
  fn shell_capture_definition() {
    let mut ctx = context();
    process(&mut ctx, "x != echo captured\n");
    assert_eq!(ctx.expand_call("x").unwrap(), "captured");
  }

  #[test]
  fn escaped_hash_expands_to_hash() {
    let mut ctx = context();
    process(&mut ctx, "x = a\\#b\n");
    assert_eq!(ctx.expand_call("x").unwrap(), "a#b");
  }

  #[test]
  fn escaped_newline_joins_lines() {
    let mut ctx = context();
    process(&mut ctx, "x = a\\\nb\n");
    assert_eq!(ctx.expand_call("x").unwrap(), "a b");
  }

  #[test]
  fn rules_register_in_the_owning_namespace() {
    let mut ctx = context();
    process(&mut ctx, "out : in\n\techo build\n");
    assert!(ctx.global_rules.find("out").is_some());
    assert_eq!(ctx.global_rules.goal().unwrap().targets, ["out"]);
  }
}
