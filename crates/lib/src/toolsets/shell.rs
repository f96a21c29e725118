//! A generic shell toolset.
//!
//! Modules bound to `shell` describe their build with plain module
//! variables:
//!
//! ```text
//! $(module hello, shell, exe)
//! me.sources = hello.c lib.c
//! me.compile = cc -c {in} -o {out}
//! me.command = cc {in} -o {out}
//! me.output  = hello
//! $(build)
//! ```
//!
//! Each source becomes an intermediate action through the `compile`
//! template; the final action links the intermediates through `command`.
//! `{in}` and `{out}` substitute at execution time, so the command sees the
//! concrete prerequisite paths the update pass collected.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::consts::DEFAULT_OUT_SUBDIR;
use crate::eval::Context;
use crate::eval::scope::Value;
use crate::graph::command::{ProcessExec, system_shell};
use crate::graph::{Action, BuildError, Command, source_transform_actions};
use crate::module::ModuleId;
use crate::toolset::Toolset;

/// Runs a shell template with `{in}`/`{out}` filled in per invocation.
#[derive(Debug)]
struct TemplateCommand {
  template: String,
  exec: ProcessExec,
}

impl TemplateCommand {
  fn new(template: &str, out_dir: &Path) -> Self {
    let (shell, _) = system_shell();
    TemplateCommand {
      template: template.to_string(),
      exec: ProcessExec::new(shell).with_mkdir(out_dir),
    }
  }
}

impl Command for TemplateCommand {
  fn execute(&mut self, targets: &[String], prerequisites: &[String]) -> Result<bool, BuildError> {
    let line = self
      .template
      .replace("{out}", &targets.join(" "))
      .replace("{in}", &prerequisites.join(" "));
    let (_, flag) = system_shell();
    let hint = targets.first().map(String::as_str).unwrap_or("");
    self.exec.run(hint, &[flag.to_string(), line])
  }
}

/// The generic shell-command toolset.
#[derive(Debug, Default)]
pub struct ShellToolset;

impl ShellToolset {
  fn out_dir(ctx: &Context, module: ModuleId) -> PathBuf {
    match &ctx.options.output_dir {
      Some(dir) => dir.clone(),
      None => ctx.module(module).dir.join(DEFAULT_OUT_SUBDIR),
    }
  }
}

impl Toolset for ShellToolset {
  fn config_module(
    &self,
    ctx: &mut Context,
    module: ModuleId,
    _args: &[String],
    vars: &HashMap<String, String>,
  ) -> bool {
    // NAME=value module arguments become module-scope variables.
    for (name, value) in vars {
      ctx
        .module_mut(module)
        .scope
        .set(name, Value::text(value.clone()), None);
    }
    true
  }

  fn use_module(&self, ctx: &mut Context, module: ModuleId, other: ModuleId) -> bool {
    debug!(
      module = %ctx.module(module).name,
      uses = %ctx.module(other).name,
      "shell module dependency"
    );
    true
  }

  fn create_actions(&self, ctx: &mut Context, module: ModuleId, _args: &[String]) -> bool {
    let name = ctx.module(module).name.clone();
    let dir = ctx.module(module).dir.clone();

    let lookup = |ctx: &mut Context, var: &str| match ctx.module_var(module, var) {
      Ok(text) => text,
      Err(e) => {
        warn!(module = %name, var, error = %e, "variable expansion failed");
        String::new()
      }
    };

    let command = lookup(ctx, "command");
    if command.is_empty() {
      warn!(module = %name, "shell module without a command");
      return false;
    }
    let compile = lookup(ctx, "compile");
    let output = match lookup(ctx, "output") {
      s if s.is_empty() => name.clone(),
      s => s,
    };

    let sources: Vec<String> = lookup(ctx, "sources")
      .split_whitespace()
      .map(|s| resolve(&dir, s))
      .collect();

    let out_dir = Self::out_dir(ctx, module);
    let out_path = resolve(&out_dir, &output);

    let prerequisites = if compile.is_empty() {
      sources.iter().cloned().map(Action::source).collect()
    } else {
      let transform = |src: &str| {
        let object = out_dir
          .join(format!(
            "{}.o",
            Path::new(src)
              .file_name()
              .map(|n| n.to_string_lossy().into_owned())
              .unwrap_or_else(|| src.to_string())
          ))
          .display()
          .to_string();
        let command: Box<dyn Command> = Box::new(TemplateCommand::new(&compile, &out_dir));
        Some((object, command))
      };
      match source_transform_actions(&sources, transform) {
        Ok(actions) => actions,
        Err(e) => {
          warn!(module = %name, error = %e, "source transform failed");
          return false;
        }
      }
    };

    let action = Action::new(out_path, Box::new(TemplateCommand::new(&command, &out_dir)))
      .with_prerequisites(prerequisites);
    ctx.module_mut(module).action = Some(action);
    true
  }
}

fn resolve(dir: &Path, path: &str) -> String {
  if Path::new(path).is_absolute() {
    path.to_string()
  } else {
    dir.join(path).display().to_string()
  }
}
