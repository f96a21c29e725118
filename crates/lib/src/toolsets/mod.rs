//! Bundled toolsets.
//!
//! Backends live behind the toolset protocol; the core never depends on
//! them. Only the generic shell toolset ships here, compiler toolchains are
//! expected to register their own.

pub mod shell;

use std::rc::Rc;

use crate::eval::{Context, EvalError};

/// Register every bundled toolset on a fresh session.
pub fn register_bundled(ctx: &mut Context) -> Result<(), EvalError> {
  ctx.register_toolset("shell", Rc::new(shell::ShellToolset))?;
  Ok(())
}
