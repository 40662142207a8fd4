//! Layered loading of [`ConnectionOptions`].
//!
//! Later layers win: built-in defaults, the per-user options file,
//! `cairn.toml` in the project directory, `cairn.local.toml` next to it,
//! then `CAIRN_*` environment variables.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use directories::ProjectDirs;

use crate::{ConnectionOptions, ConnectionSettings};

/// Options checked into a project.
pub const PROJECT_OPTIONS_FILE: &str = "cairn.toml";

/// Per-checkout overrides of [`PROJECT_OPTIONS_FILE`], kept out of version
/// control.
pub const LOCAL_OPTIONS_FILE: &str = "cairn.local.toml";

/// `client.toml` in the platform config directory, e.g.
/// `~/.config/cairn/client.toml` on Linux. `None` without a home directory.
pub fn user_options_file() -> Option<PathBuf> {
    ProjectDirs::from("rs", "cairn", "cairn").map(|dirs| dirs.config_dir().join("client.toml"))
}

/// Builds [`ConnectionOptions`] from every layer that exists.
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    include_user_config: bool,
}

impl ConfigLoader {
    /// Loads from the current directory with the `CAIRN` prefix.
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "CAIRN".to_string(),
            include_user_config: true,
        }
    }

    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Ignores the per-user options file.
    pub fn without_user_config(mut self) -> Self {
        self.include_user_config = false;
        self
    }

    fn option_files(&self) -> Vec<PathBuf> {
        let user = self
            .include_user_config
            .then(user_options_file)
            .flatten();
        user.into_iter()
            .chain([
                self.project_dir.join(PROJECT_OPTIONS_FILE),
                self.project_dir.join(LOCAL_OPTIONS_FILE),
            ])
            .filter(|path| path.is_file())
            .collect()
    }

    pub fn load(self) -> Result<ConnectionOptions> {
        let mut builder = Config::builder().add_source(
            Config::try_from(&ConnectionOptions::default())
                .context("Failed to render default options")?,
        );
        for path in self.option_files() {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        // Options are flat: CAIRN_MAX_QUEUE_SIZE maps to max_queue_size.
        builder = builder.add_source(
            Environment::with_prefix(&self.env_prefix)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("gossip_seeds"),
        );

        builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// [`ConfigLoader::load`] followed by validation.
    pub fn load_settings(self) -> Result<ConnectionSettings> {
        let options = self.load()?;
        ConnectionSettings::from_options(&options).context("Invalid connection configuration")
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EndpointSource;
    use cairn_types::{Endpoint, NodePreference};
    use std::fs;
    use tempfile::tempdir;

    fn loader(dir: &Path) -> ConfigLoader {
        // Unique prefix keeps developer environment variables out of the test.
        ConfigLoader::new()
            .with_project_dir(dir)
            .with_env_prefix("CAIRN_LOADER_TEST")
            .without_user_config()
    }

    #[test]
    fn test_user_options_file_is_namespaced() {
        // Not every CI runner has a home directory.
        if let Some(path) = user_options_file() {
            assert!(path.ends_with("client.toml"));
            assert!(path.to_string_lossy().contains("cairn"));
        }
    }

    #[test]
    fn test_option_files_in_precedence_order() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();
        assert!(loader(project_dir).option_files().is_empty());

        fs::write(project_dir.join(LOCAL_OPTIONS_FILE), "").expect("Failed to write config");
        fs::write(project_dir.join(PROJECT_OPTIONS_FILE), "").expect("Failed to write config");
        assert_eq!(
            loader(project_dir).option_files(),
            vec![
                project_dir.join(PROJECT_OPTIONS_FILE),
                project_dir.join(LOCAL_OPTIONS_FILE),
            ]
        );
    }

    #[test]
    fn test_load_defaults() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let options = loader(temp_dir.path()).load().expect("Failed to load config");

        assert_eq!(options, ConnectionOptions::default());
    }

    #[test]
    fn test_load_project_config() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        let config_content = r#"
gossip_seeds = ["node1:2113", "node2:2113", "node3"]
max_queue_size = 200
node_preference = "follower"
operation_timeout_ms = 2500
"#;
        fs::write(project_dir.join("cairn.toml"), config_content)
            .expect("Failed to write config");

        let settings = loader(project_dir)
            .load_settings()
            .expect("Failed to load config");

        assert_eq!(settings.max_queue_size(), 200);
        assert_eq!(settings.discovery().node_preference, NodePreference::Follower);
        assert_eq!(
            settings.operation_timeout(),
            std::time::Duration::from_millis(2500)
        );
        assert_eq!(
            settings.endpoint_source(),
            &EndpointSource::GossipSeeds(vec![
                Endpoint::new("node1", 2113),
                Endpoint::new("node2", 2113),
                Endpoint::new("node3", 2113),
            ])
        );
    }

    #[test]
    fn test_local_overrides() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("cairn.toml"),
            "connect_to = \"tcp://prod:1113\"\nmax_retries = 3\n",
        )
        .expect("Failed to write project config");

        fs::write(
            project_dir.join("cairn.local.toml"),
            "connect_to = \"tcp://localhost:1113\"\n",
        )
        .expect("Failed to write local config");

        let options = loader(project_dir).load().expect("Failed to load config");

        assert_eq!(options.connect_to.as_deref(), Some("tcp://localhost:1113"));
        assert_eq!(options.max_retries, 3);
    }

    #[test]
    fn test_written_config_loads_back() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        let written = ConnectionOptions {
            max_concurrent_items: 64,
            ..ConnectionOptions::development()
        };
        written
            .write_project_config(project_dir)
            .expect("Failed to write config");

        let loaded = loader(project_dir).load().expect("Failed to load config");
        assert_eq!(loaded, written);
    }

    #[test]
    fn test_invalid_settings_fail_to_load() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        fs::write(temp_dir.path().join("cairn.toml"), "max_queue_size = 10\n")
            .expect("Failed to write config");

        // No endpoint source configured.
        assert!(loader(temp_dir.path()).load_settings().is_err());
    }
}
