//! Application context for dependency injection.

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::pipeline::DeployOptions;
use crate::settings::{SETTINGS_FILE, Settings, load_settings};

/// Resolved configuration paths and settings.
///
/// Frontends create this once and derive option records from it.
#[derive(Debug, Clone)]
pub struct AppContext {
    config_dir: PathBuf,
    working_dir: PathBuf,
    settings: Settings,
}

impl AppContext {
    /// Load settings from the user config directory, then apply the
    /// process environment.
    pub fn load(working_dir: PathBuf) -> Result<Self> {
        let config_dir = dirs::config_dir()
            .map(|p| p.join("kiln"))
            .or_else(|| dirs::home_dir().map(|h| h.join(".config").join("kiln")))
            .unwrap_or_else(|| working_dir.join(".kiln"));
        Self::with_config_dir(working_dir, config_dir, |key| std::env::var(key).ok())
    }

    /// Create a context with a custom config directory and environment
    /// (for testing).
    pub fn with_config_dir<F>(working_dir: PathBuf, config_dir: PathBuf, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = load_settings(&config_dir.join(SETTINGS_FILE))?;
        settings.apply_env(env)?;
        Ok(Self {
            config_dir,
            working_dir,
            settings,
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir.join(SETTINGS_FILE)
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Resolve a model path against the working directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        }
    }

    /// Pipeline options derived from the settings.
    pub fn deploy_options(&self, author: impl Into<String>) -> DeployOptions {
        DeployOptions {
            apply: self.settings.apply_options(),
            rollout: self.settings.rollout_options(),
            revisions: self.settings.revision_options(),
            namespace: None,
            author: author.into(),
            salt: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::OutputFormat;
    use tempfile::TempDir;

    #[test]
    fn settings_come_from_config_dir_and_env() {
        let config = TempDir::new().unwrap();
        std::fs::write(
            config.path().join(SETTINGS_FILE),
            "[apply]\nconcurrency = 2\n",
        )
        .unwrap();

        let ctx = AppContext::with_config_dir(
            PathBuf::from("/work"),
            config.path().to_path_buf(),
            |key| (key == "KILN_OUTPUT").then(|| "json".to_string()),
        )
        .unwrap();

        assert_eq!(ctx.settings().apply.concurrency, 2);
        assert_eq!(ctx.settings().output.format, OutputFormat::Json);
        let options = ctx.deploy_options("dev");
        assert_eq!(options.apply.concurrency, 2);
        assert_eq!(options.author, "dev");
    }

    #[test]
    fn relative_paths_resolve_against_working_dir() {
        let config = TempDir::new().unwrap();
        let ctx = AppContext::with_config_dir(
            PathBuf::from("/work"),
            config.path().to_path_buf(),
            |_| None,
        )
        .unwrap();
        assert_eq!(ctx.resolve(Path::new("kiln.yaml")), PathBuf::from("/work/kiln.yaml"));
        assert_eq!(ctx.resolve(Path::new("/abs/app.yaml")), PathBuf::from("/abs/app.yaml"));
    }
}
