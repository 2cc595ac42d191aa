//! Environment-driven configuration for the shader compiler's file
//! resolution. The grammar has no `#include` directive, so these are
//! carried as resolvable roots for future preprocessor work rather than
//! wired into the lexer today.

use std::env;
use std::path::PathBuf;

const SHADERS_PATH_VAR: &str = "SHADERS_PATH";
const SHADER_INCLUDE_PATH_VAR: &str = "SHADER_INCLUDE_PATH";

/// Resolved from `SHADERS_PATH` and `SHADER_INCLUDE_PATH` at `from_env()`
/// time. Both are optional; a missing `SHADERS_PATH` falls back to the
/// current directory, and a missing include path yields an empty list.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub shaders_path: PathBuf,
    pub shader_include_path: Vec<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        let shaders_path = env::var_os(SHADERS_PATH_VAR).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
        let shader_include_path = env::var(SHADER_INCLUDE_PATH_VAR)
            .map(|raw| raw.split(':').filter(|s| !s.is_empty()).map(PathBuf::from).collect())
            .unwrap_or_default();
        log::debug!(
            "shader config: shaders_path={} include_path={:?}",
            shaders_path.display(),
            shader_include_path
        );
        Config { shaders_path, shader_include_path }
    }

    /// Resolves `name` against `shaders_path`, appending `.sl` if `name`
    /// doesn't already carry an extension.
    pub fn resolve(&self, name: &str) -> PathBuf {
        let mut path = self.shaders_path.join(name);
        if path.extension().is_none() {
            path.set_extension("sl");
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_shaders_path_falls_back_to_current_dir() {
        // SAFETY: test-only env mutation, no other thread touches these vars.
        unsafe {
            env::remove_var(SHADERS_PATH_VAR);
        }
        let config = Config::from_env();
        assert_eq!(config.shaders_path, PathBuf::from("."));
    }

    #[test]
    fn resolve_appends_sl_extension() {
        let config = Config { shaders_path: PathBuf::from("/shaders"), shader_include_path: Vec::new() };
        assert_eq!(config.resolve("matte"), PathBuf::from("/shaders/matte.sl"));
    }

    #[test]
    fn include_path_splits_on_colon_and_skips_empty_segments() {
        unsafe {
            env::set_var(SHADER_INCLUDE_PATH_VAR, "/a:/b::/c");
        }
        let config = Config::from_env();
        assert_eq!(config.shader_include_path, vec![PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/c")]);
        unsafe {
            env::remove_var(SHADER_INCLUDE_PATH_VAR);
        }
    }
}
