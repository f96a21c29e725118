use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context as _, Result};
use clap::Parser;
use owo_colors::OwoColorize;
use smelt_lib::{BuildOptions, Context, Value, build, toolsets};
use tracing_subscriber::EnvFilter;

/// smelt - an incremental, script-driven build orchestrator
#[derive(Parser)]
#[command(name = "smelt")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Discover build scripts under this directory
  #[arg(short = 'C', long = "directory")]
  directory: Option<PathBuf>,

  /// Place build outputs in this directory
  #[arg(short = 'o', long = "output")]
  output: Option<PathBuf>,

  /// Descend into version-control metadata during discovery
  #[arg(long)]
  no_vcs_ignore: bool,

  /// Parallel job limit for command execution
  #[arg(short = 'j', long = "jobs", default_value_t = 1)]
  jobs: usize,

  /// Warn when an undefined variable is expanded
  #[arg(short = 'w', long)]
  warn_undefined: bool,

  /// Print the resolved module graph as JSON after the run
  #[arg(long)]
  dump: bool,

  /// Increase log verbosity (-v info, -vv debug)
  #[arg(short, long, action = clap::ArgAction::Count, global = true)]
  verbose: u8,

  /// Build goals or NAME=value variable overrides
  args: Vec<String>,
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  match run(cli) {
    Ok(code) => code,
    Err(e) => {
      eprintln!("{} {e:#}", "smelt:".red().bold());
      ExitCode::FAILURE
    }
  }
}

fn init_tracing(verbose: u8) {
  let fallback = match verbose {
    0 => "warn",
    1 => "info",
    _ => "debug",
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}

fn run(cli: Cli) -> Result<ExitCode> {
  let directory = match cli.directory {
    Some(d) => dunce::canonicalize(&d)
      .with_context(|| format!("cannot change to directory {}", d.display()))?,
    None => PathBuf::from("."),
  };

  // Trailing arguments: NAME=value pairs become global variables, the rest
  // are build goals.
  let mut goals = Vec::new();
  let mut vars = Vec::new();
  for arg in &cli.args {
    match arg.split_once('=') {
      Some((name, value)) if !name.is_empty() => {
        vars.push((name.to_string(), value.to_string()));
      }
      _ => goals.push(arg.clone()),
    }
  }

  let mut ctx = Context::new(BuildOptions {
    directory,
    output_dir: cli.output,
    ignore_vcs: !cli.no_vcs_ignore,
    jobs: cli.jobs,
    warn_undefined: cli.warn_undefined,
  });
  toolsets::register_bundled(&mut ctx).map_err(|e| anyhow::anyhow!("{e}"))?;
  for (name, value) in vars {
    ctx
      .set(&name, Value::text(value))
      .map_err(|e| anyhow::anyhow!("{e}"))?;
  }

  match build(&mut ctx, &goals) {
    Ok(report) => {
      for (path, error) in &report.script_failures {
        eprintln!("{} {}: {error}", "error:".red().bold(), path.display());
      }
      for (subject, error) in &report.failed {
        eprintln!("{} {subject}: {error}", "error:".red().bold());
      }

      if cli.dump {
        let summary = smelt_lib::driver::summarize(&ctx);
        println!("{}", serde_json::to_string_pretty(&summary)?);
      }

      if report.success() {
        if report.updated_targets.is_empty() {
          eprintln!("{} nothing to update", "smelt:".cyan().bold());
        } else {
          eprintln!(
            "{} updated {} target(s)",
            "smelt:".green().bold(),
            report.updated_targets.len()
          );
        }
        Ok(ExitCode::SUCCESS)
      } else {
        eprintln!("{} build failed", "smelt:".red().bold());
        Ok(ExitCode::FAILURE)
      }
    }
    Err(e) => {
      eprintln!("{} E{:03}: {e}", "smelt:".red().bold(), e.code());
      Ok(ExitCode::FAILURE)
    }
  }
}
