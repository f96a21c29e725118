//! Script discovery: a recursive walk that collects build scripts while
//! skipping version-control metadata and backup files.
//!
//! Discovery I/O problems are logged and the walk continues; a script that
//! cannot be read is a per-script failure later, not a discovery failure.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::consts::SCRIPT_FILE_NAME;

struct MetaRule {
  name: &'static str,
  dir_only: bool,
  pattern: &'static str,
}

const META_RULES: &[MetaRule] = &[
  MetaRule {
    name: "backup",
    dir_only: false,
    pattern: r"[^~]*~$",
  },
  MetaRule {
    name: "git",
    dir_only: true,
    pattern: r"^\.git$",
  },
  MetaRule {
    name: "git",
    dir_only: false,
    pattern: r"^\.gitignore$",
  },
  MetaRule {
    name: "mercurial",
    dir_only: true,
    pattern: r"^\.hg$",
  },
  MetaRule {
    name: "subversion",
    dir_only: true,
    pattern: r"^\.svn$",
  },
  MetaRule {
    name: "cvs",
    dir_only: false,
    pattern: r"^CVS$",
  },
];

fn meta_patterns() -> &'static Vec<(&'static MetaRule, Regex)> {
  static PATTERNS: OnceLock<Vec<(&'static MetaRule, Regex)>> = OnceLock::new();
  PATTERNS.get_or_init(|| {
    META_RULES
      .iter()
      .map(|r| (r, Regex::new(r.pattern).expect("static pattern")))
      .collect()
  })
}

/// Whether a directory entry is version-control metadata or a backup file.
pub fn is_vcs_meta(name: &str, is_dir: bool) -> bool {
  meta_patterns()
    .iter()
    .any(|(rule, re)| (is_dir || !rule.dir_only) && re.is_match(name))
}

/// Walk `root` and collect every build script, in path order.
pub fn discover_scripts(root: &Path, ignore_vcs: bool) -> Vec<PathBuf> {
  let mut scripts = Vec::new();
  let walker = WalkDir::new(root)
    .sort_by_file_name()
    .into_iter()
    .filter_entry(move |entry| {
      if !ignore_vcs {
        return true;
      }
      let name = entry.file_name().to_string_lossy();
      if is_vcs_meta(&name, entry.file_type().is_dir()) {
        debug!(path = %entry.path().display(), "skipping version-control metadata");
        return false;
      }
      true
    });

  for entry in walker {
    let entry = match entry {
      Ok(e) => e,
      Err(e) => {
        warn!(error = %e, "discovery error, continuing");
        continue;
      }
    };
    if entry.file_type().is_file() && entry.file_name() == SCRIPT_FILE_NAME {
      scripts.push(entry.into_path());
    }
  }
  scripts
}

#[cfg(test)]
mod tests {
  use std::fs;

  use tempfile::TempDir;

  use super::*;

  #[test]
  fn vcs_metadata_matching() {
    assert!(is_vcs_meta(".git", true));
    assert!(is_vcs_meta(".gitignore", false));
    assert!(is_vcs_meta(".hg", true));
    assert!(is_vcs_meta(".svn", true));
    assert!(is_vcs_meta("CVS", false));
    assert!(is_vcs_meta("notes.txt~", false));
    assert!(!is_vcs_meta("src", true));
    assert!(!is_vcs_meta("main.c", false));
    // Directory-only rules do not match plain files.
    assert!(!is_vcs_meta(".hg", false));
  }

  #[test]
  fn discovery_finds_nested_scripts_and_skips_vcs() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    fs::write(root.join(SCRIPT_FILE_NAME), "").unwrap();
    fs::create_dir_all(root.join("sub/deeper")).unwrap();
    fs::write(root.join("sub/deeper").join(SCRIPT_FILE_NAME), "").unwrap();
    fs::create_dir_all(root.join(".git")).unwrap();
    fs::write(root.join(".git").join(SCRIPT_FILE_NAME), "").unwrap();
    fs::write(root.join("other.txt"), "").unwrap();

    let scripts = discover_scripts(root, true);
    assert_eq!(scripts.len(), 2);
    assert!(scripts.iter().all(|p| !p.to_string_lossy().contains(".git")));

    let unfiltered = discover_scripts(root, false);
    assert_eq!(unfiltered.len(), 3);
  }
}
