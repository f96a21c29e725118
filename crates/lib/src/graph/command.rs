//! Command execution wrapper.
//!
//! [`ProcessExec`] is the single funnel for spawning external tools: it
//! resolves home-relative program paths, creates requested directories before
//! running, reuses its capture buffers across invocations, re-execs under a
//! 32-bit shim where required, and supports a path-less virtual command that
//! runs a closure instead of a process. A non-zero exit dumps the captured
//! output and raises a build-fatal error naming the command line.

use std::fs;
use std::path::PathBuf;
use std::process;

use tracing::debug;

use super::BuildError;

/// The platform shell and its command flag.
pub(crate) fn system_shell() -> (&'static str, &'static str) {
  #[cfg(unix)]
  {
    ("sh", "-c")
  }
  #[cfg(windows)]
  {
    ("cmd", "/C")
  }
}

type VirtualFn = Box<dyn FnMut() -> bool>;

/// Reusable process runner with captured output.
pub struct ProcessExec {
  program: String,
  dir: Option<PathBuf>,
  mkdir: Option<PathBuf>,
  ia32: bool,
  stdout: String,
  stderr: String,
  virtual_fn: Option<VirtualFn>,
}

impl std::fmt::Debug for ProcessExec {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProcessExec")
      .field("program", &self.program)
      .field("dir", &self.dir)
      .field("ia32", &self.ia32)
      .field("virtual", &self.virtual_fn.is_some())
      .finish()
  }
}

impl ProcessExec {
  pub fn new(program: impl Into<String>) -> Self {
    ProcessExec {
      program: program.into(),
      dir: None,
      mkdir: None,
      ia32: false,
      stdout: String::new(),
      stderr: String::new(),
      virtual_fn: None,
    }
  }

  /// A path-less command backed by a closure.
  pub fn virtual_with(f: impl FnMut() -> bool + 'static) -> Self {
    let mut exec = ProcessExec::new("");
    exec.virtual_fn = Some(Box::new(f));
    exec
  }

  pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.dir = Some(dir.into());
    self
  }

  /// Ensure a directory exists before every run.
  pub fn with_mkdir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.mkdir = Some(dir.into());
    self
  }

  /// Re-exec under `linux32` when running a 32-bit-only tool on a 64-bit
  /// Linux host.
  pub fn with_ia32(mut self, ia32: bool) -> Self {
    self.ia32 = ia32;
    self
  }

  pub fn stdout(&self) -> &str {
    &self.stdout
  }

  pub fn stderr(&self) -> &str {
    &self.stderr
  }

  /// Run the command, capturing output. Returns whether the command reported
  /// work done; failure to spawn or a non-zero exit is fatal.
  pub fn run(&mut self, target_hint: &str, args: &[String]) -> Result<bool, BuildError> {
    let mut program = self.program.clone();
    if let Some(rest) = program.strip_prefix("~/")
      && let Some(home) = dirs::home_dir()
    {
      program = home.join(rest).display().to_string();
    }

    if let Some(dir) = &self.mkdir {
      fs::create_dir_all(dir)?;
    }

    // One buffer pair per runner, reset between invocations.
    self.stdout.clear();
    self.stderr.clear();

    if program.is_empty() {
      let Some(f) = self.virtual_fn.as_mut() else {
        return Err(BuildError::NoCommand {
          target: target_hint.to_string(),
        });
      };
      return Ok(f());
    }

    let mut cmd = process::Command::new(&program);
    cmd.args(args);
    if self.ia32 && cfg!(all(target_os = "linux", target_arch = "x86_64")) {
      cmd = process::Command::new("linux32");
      cmd.arg(&program).args(args);
    }
    if let Some(dir) = &self.dir {
      cmd.current_dir(dir);
    }

    debug!(program = %program, target = %target_hint, "spawning");

    let output = cmd.output().map_err(|e| BuildError::Spawn {
      program: program.clone(),
      source: e,
    })?;
    self
      .stdout
      .push_str(&String::from_utf8_lossy(&output.stdout));
    self
      .stderr
      .push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
      if !self.stdout.is_empty() {
        eprintln!("{}", self.stdout.trim_end());
      }
      if !self.stderr.is_empty() {
        eprintln!("{}", self.stderr.trim_end());
      }
      return Err(BuildError::CmdFailed {
        cmd: command_line(&program, args),
        code: output.status.code(),
      });
    }
    Ok(true)
  }
}

fn command_line(program: &str, args: &[String]) -> String {
  let mut line = program.to_string();
  for a in args {
    line.push(' ');
    line.push_str(a);
  }
  line
}

/// A command that runs one shell line; used by rule recipes and the shell
/// toolset.
#[derive(Debug)]
pub struct ShellCommand {
  line: String,
  exec: ProcessExec,
}

impl ShellCommand {
  pub fn new(line: impl Into<String>) -> Self {
    let (shell, _) = system_shell();
    ShellCommand {
      line: line.into(),
      exec: ProcessExec::new(shell),
    }
  }

  pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.exec = self.exec.with_dir(dir);
    self
  }

  pub fn with_mkdir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.exec = self.exec.with_mkdir(dir);
    self
  }
}

impl super::Command for ShellCommand {
  fn execute(&mut self, targets: &[String], _prerequisites: &[String]) -> Result<bool, BuildError> {
    let (_, flag) = system_shell();
    let hint = targets.first().map(String::as_str).unwrap_or("");
    self
      .exec
      .run(hint, &[flag.to_string(), self.line.clone()])
  }
}
