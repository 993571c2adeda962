//! CLI flag/env layering for the demonstration binary.
//!
//! The pipeline's own runtime configuration (worker threads, diagnostics) is
//! loaded separately via `chronopipe_core::ChronopipeConfig::load`. These
//! helpers resolve the remaining CLI-level settings with the same file <
//! env < explicit-flag precedence, following the pattern in
//! `chronopipe_core::config`.

use std::path::PathBuf;

/// Resolves the log level: an explicit CLI flag, else `CHRONOPIPE_LOG_LEVEL`,
/// else `"info"`.
#[must_use]
pub fn resolve_log_level(flag: Option<&str>) -> String {
    flag.map(str::to_string)
        .or_else(|| std::env::var("CHRONOPIPE_LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string())
}

/// Resolves the store root directory: an explicit CLI flag, else
/// `CHRONOPIPE_STORE_DIR`, else `./chronopipe-store`.
#[must_use]
pub fn resolve_store_dir(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os("CHRONOPIPE_STORE_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./chronopipe-store"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_takes_precedence_over_default() {
        assert_eq!(resolve_log_level(Some("debug")), "debug");
    }

    #[test]
    fn default_log_level_is_info_absent_flag_and_env() {
        std::env::remove_var("CHRONOPIPE_LOG_LEVEL");
        assert_eq!(resolve_log_level(None), "info");
    }

    #[test]
    fn default_store_dir_is_relative_chronopipe_store() {
        std::env::remove_var("CHRONOPIPE_STORE_DIR");
        assert_eq!(resolve_store_dir(None), PathBuf::from("./chronopipe-store"));
    }
}
