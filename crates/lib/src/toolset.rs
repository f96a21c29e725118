//! The toolset protocol.
//!
//! A toolset represents a toolchain like a compiler suite. Toolsets are
//! registered under a unique name before any script references them; scripts
//! bind modules to a toolset through `$(module name, toolset, kind)`. The
//! three hooks are the whole contract between the core and a backend.

use std::collections::HashMap;

use crate::eval::Context;
use crate::module::ModuleId;

/// Backend contract, stable across all toolchains.
pub trait Toolset {
  /// Configure a freshly declared module. `args` and `vars` come from the
  /// `$(module ...)` invocation.
  fn config_module(
    &self,
    ctx: &mut Context,
    module: ModuleId,
    args: &[String],
    vars: &HashMap<String, String>,
  ) -> bool {
    let _ = (ctx, module, args, vars);
    true
  }

  /// Create the module's action graph. Returning false marks the module as
  /// not buildable.
  fn create_actions(&self, ctx: &mut Context, module: ModuleId, args: &[String]) -> bool {
    let _ = (ctx, module, args);
    false
  }

  /// Let the toolset decide how `module` consumes `other`.
  fn use_module(&self, ctx: &mut Context, module: ModuleId, other: ModuleId) -> bool {
    let _ = (ctx, module, other);
    false
  }
}

/// A toolset with no behavior of its own; useful as an embedding base and in
/// tests.
#[derive(Debug, Default)]
pub struct BasicToolset;

impl Toolset for BasicToolset {}
