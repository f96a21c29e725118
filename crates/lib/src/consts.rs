//! Shared constants.

/// Build scripts are files with exactly this name.
pub const SCRIPT_FILE_NAME: &str = ".smelt";

/// Default subdirectory for toolset outputs when no output directory is
/// configured.
pub const DEFAULT_OUT_SUBDIR: &str = "smelt-out";
