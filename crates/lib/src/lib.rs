//! smelt-lib: core engine of the smelt build orchestrator
//!
//! The crate is organized the way the build runs:
//! - `parse`: lexer and typed node tree over raw script bytes
//! - `eval`: scoped variable resolution, macro expansion and the builtin table
//! - `module` / `toolset`: named build units and the backend protocol
//! - `graph`: the action graph and timestamp-driven incremental update
//! - `rules`: make-style rule targets
//! - `discover` / `driver`: script discovery and the build orchestration

pub mod consts;
pub mod discover;
pub mod driver;
pub mod eval;
pub mod graph;
pub mod module;
pub mod parse;
pub mod rules;
pub mod toolset;
pub mod toolsets;

pub use driver::{BuildOptions, BuildReport, DriverError, build};
pub use eval::Context;
pub use eval::scope::{Definition, Fragment, Scope, Value};
pub use graph::{Action, BuildError, Command, DynamicCommand, Recipe, UpdateOutcome};
pub use module::{Module, ModuleId};
pub use parse::{Node, NodeKind, ParseError, ScriptBuffer, SourceLocation, parse_script};
pub use toolset::{BasicToolset, Toolset};
