//! Path configuration for synTOF runs.
//!
//! Three directories are configurable:
//! - **Data directory**: per-sample event CSV files
//! - **Output directory**: label, hidden-coordinate and cluster-count tables, plots
//! - **Weights directory**: pretrained branch weights and joint models
//!
//! Resolution order, highest priority first:
//! 1. CLI arguments
//! 2. Environment variables (`SYNTOF_DATA_DIR`, `SYNTOF_OUTPUT_DIR`, `SYNTOF_WEIGHTS_DIR`, `SYNTOF_BASE_DIR`)
//! 3. Config file (`~/.config/syntof/config.toml`)
//! 4. OS default directories
//!
//! ```ignore
//! use syntof_core::config::PathConfig;
//!
//! let config = PathConfig::builder()
//!     .base_dir("/mnt/cytof/run7")
//!     .build();
//! let weights = config.weights_dir().join("PD_a_rep0.safetensors");
//! ```

use clap::Args;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// CLI arguments for path configuration; flatten into a binary's parser.
#[derive(Args, Debug, Clone, Default)]
pub struct PathArgs {
    /// Directory holding input event CSV files
    #[arg(long, env = "SYNTOF_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Directory for exported tables and plots
    #[arg(long, env = "SYNTOF_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Directory for pretrained and joint model weights
    #[arg(long, env = "SYNTOF_WEIGHTS_DIR")]
    pub weights_dir: Option<PathBuf>,

    /// Base directory (data/, output/ and weights/ are created beneath it)
    #[arg(long, env = "SYNTOF_BASE_DIR")]
    pub base_dir: Option<PathBuf>,

    /// Path to config file
    #[arg(long, env = "SYNTOF_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,
}

/// On-disk form of [`PathConfig`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PathConfigFile {
    pub data_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub weights_dir: Option<PathBuf>,
    /// Overrides the individual paths when set
    pub base_dir: Option<PathBuf>,
}

/// Resolved directories for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathConfig {
    data_dir: PathBuf,
    output_dir: PathBuf,
    weights_dir: PathBuf,
}

impl PathConfig {
    /// Resolve from already-parsed CLI arguments (CLI > env > file > defaults).
    pub fn from_path_args(args: PathArgs) -> Self {
        let file_config = Self::load_config_file(args.config_file.as_deref());

        let base_dir = args
            .base_dir
            .or(file_config.base_dir.clone())
            .or_else(|| env::var("SYNTOF_BASE_DIR").ok().map(PathBuf::from));

        let (data_default, output_default, weights_default) = Self::default_dirs();

        let data_dir = args
            .data_dir
            .or_else(|| base_dir.as_ref().map(|b| b.join("data")))
            .or(file_config.data_dir)
            .unwrap_or(data_default);

        let output_dir = args
            .output_dir
            .or_else(|| base_dir.as_ref().map(|b| b.join("output")))
            .or(file_config.output_dir)
            .unwrap_or(output_default);

        let weights_dir = args
            .weights_dir
            .or_else(|| base_dir.as_ref().map(|b| b.join("weights")))
            .or(file_config.weights_dir)
            .unwrap_or(weights_default);

        PathConfig {
            data_dir,
            output_dir,
            weights_dir,
        }
    }

    pub fn builder() -> PathConfigBuilder {
        PathConfigBuilder::new()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn weights_dir(&self) -> &Path {
        &self.weights_dir
    }

    /// Create all directories if missing.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        fs::create_dir_all(&self.output_dir)?;
        fs::create_dir_all(&self.weights_dir)?;
        Ok(())
    }

    pub fn print_summary(&self) {
        println!("synTOF Path Configuration:");
        println!("  Data:    {:?}", self.data_dir);
        println!("  Output:  {:?}", self.output_dir);
        println!("  Weights: {:?}", self.weights_dir);
    }

    fn default_dirs() -> (PathBuf, PathBuf, PathBuf) {
        if let Some(proj_dirs) = ProjectDirs::from("", "", "syntof") {
            let data = proj_dirs.data_dir();
            (data.join("data"), data.join("output"), data.join("weights"))
        } else {
            let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            (cwd.join("data"), cwd.join("output"), cwd.join("weights"))
        }
    }

    fn load_config_file(path: Option<&Path>) -> PathConfigFile {
        let config_path = path.map(PathBuf::from).or_else(|| {
            ProjectDirs::from("", "", "syntof").map(|dirs| dirs.config_dir().join("config.toml"))
        });

        let Some(path) = config_path else {
            return PathConfigFile::default();
        };
        if !path.exists() {
            return PathConfigFile::default();
        }
        match fs::read_to_string(&path).map(|s| toml::from_str::<PathConfigFile>(&s)) {
            Ok(Ok(config)) => config,
            Ok(Err(e)) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring malformed path config");
                PathConfigFile::default()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read path config");
                PathConfigFile::default()
            }
        }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        let (data_dir, output_dir, weights_dir) = Self::default_dirs();
        PathConfig {
            data_dir,
            output_dir,
            weights_dir,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathConfigBuilder {
    data_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    weights_dir: Option<PathBuf>,
    base_dir: Option<PathBuf>,
}

impl PathConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    pub fn output_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.output_dir = Some(path.into());
        self
    }

    pub fn weights_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.weights_dir = Some(path.into());
        self
    }

    /// Set base directory (data/, output/ and weights/ beneath it)
    pub fn base_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.base_dir = Some(path.into());
        self
    }

    pub fn build(self) -> PathConfig {
        let (data_default, output_default, weights_default) = match &self.base_dir {
            Some(base) => (base.join("data"), base.join("output"), base.join("weights")),
            None => PathConfig::default_dirs(),
        };

        PathConfig {
            data_dir: self.data_dir.unwrap_or(data_default),
            output_dir: self.output_dir.unwrap_or(output_default),
            weights_dir: self.weights_dir.unwrap_or(weights_default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PathConfig::default();
        assert!(!config.data_dir().as_os_str().is_empty());
        assert!(!config.output_dir().as_os_str().is_empty());
        assert!(!config.weights_dir().as_os_str().is_empty());
    }

    #[test]
    fn test_base_dir_builder() {
        let config = PathConfig::builder()
            .base_dir("/mnt/cytof")
            .weights_dir("/models")
            .build();

        assert_eq!(config.data_dir(), Path::new("/mnt/cytof/data"));
        assert_eq!(config.output_dir(), Path::new("/mnt/cytof/output"));
        assert_eq!(config.weights_dir(), Path::new("/models"));
    }

    #[test]
    fn test_cli_args_take_priority() {
        let args = PathArgs {
            data_dir: Some(PathBuf::from("/cli/data")),
            base_dir: Some(PathBuf::from("/base")),
            config_file: Some(PathBuf::from("/nonexistent/syntof.toml")),
            ..Default::default()
        };
        let config = PathConfig::from_path_args(args);
        assert_eq!(config.data_dir(), Path::new("/cli/data"));
        assert_eq!(config.output_dir(), Path::new("/base/output"));
    }
}
