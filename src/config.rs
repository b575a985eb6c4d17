//! Orchestrator configuration.
//!
//! Values are layered once, at the entry point:
//!
//! 1. command-line flag (clap also fills these from `DLX_*` environment
//!    variables)
//! 2. `config.json` under the platform config directory
//!    (`~/.config/dlx-orchestrator/config.json` on Linux)
//! 3. built-in defaults
//!
//! The result is an immutable [`SessionConfig`] handed to each component.
//!
//! ## Example config
//!
//! ```json
//! {
//!   "host": "127.0.0.1",
//!   "request_port": 5555,
//!   "solution_port": 5556,
//!   "build_folder": "build",
//!   "container": { "image": "dlx-solver:latest", "platform": "linux/amd64" }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{DlxError, Result};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_REQUEST_PORT: u16 = 5555;
pub const DEFAULT_SOLUTION_PORT: u16 = 5556;
pub const DEFAULT_BUILD_FOLDER: &str = "build";
pub const DEFAULT_CONTAINER_RUNTIME: &str = "docker";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub const ENCODER_BINARY: &str = "sudoku_encoder";
pub const SOLVER_BINARY: &str = "dlx";
pub const DECODER_BINARY: &str = "sudoku_decoder";

/// Where the solver server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub host: String,
    pub request_port: u16,
    pub solution_port: u16,
}

impl ServerEndpoint {
    pub fn new(host: impl Into<String>, request_port: u16, solution_port: u16) -> Self {
        Self {
            host: host.into(),
            request_port,
            solution_port,
        }
    }

    pub fn request_address(&self) -> String {
        format!("{}:{}", self.host, self.request_port)
    }

    pub fn solution_address(&self) -> String {
        format!("{}:{}", self.host, self.solution_port)
    }
}

impl Default for ServerEndpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_REQUEST_PORT, DEFAULT_SOLUTION_PORT)
    }
}

/// Container settings when the solver server runs in a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSettings {
    /// `docker`, `podman`, ...
    pub runtime: String,
    pub image: String,
    /// Container name, used for `stop`.
    pub name: String,
    /// `--platform` override (e.g. `linux/amd64` on Apple silicon).
    pub platform: Option<String>,
}

/// How the solver server is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLaunch {
    /// Run `<build>/dlx --server <req> <sol>` directly.
    Local,
    /// Run the solver inside a container with both ports published.
    Container(ContainerSettings),
}

/// The three external executables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binaries {
    pub encoder: PathBuf,
    pub solver: PathBuf,
    pub decoder: PathBuf,
}

impl Binaries {
    /// Locate the encoder, solver and decoder in `build_folder`.
    ///
    /// # Errors
    ///
    /// [`DlxError::Configuration`] if the folder or any executable is missing.
    pub fn resolve(build_folder: &Path) -> Result<Self> {
        let build_folder = absolutize(build_folder)?;
        if !build_folder.is_dir() {
            return Err(DlxError::Configuration(format!(
                "Build folder '{}' does not exist.",
                build_folder.display()
            )));
        }
        Ok(Self {
            encoder: resolve_binary(&build_folder, ENCODER_BINARY)?,
            solver: resolve_binary(&build_folder, SOLVER_BINARY)?,
            decoder: resolve_binary(&build_folder, DECODER_BINARY)?,
        })
    }
}

/// Find `binary_name` in `build_folder`, trying `.exe` first on Windows.
pub fn resolve_binary(build_folder: &Path, binary_name: &str) -> Result<PathBuf> {
    let base = build_folder.join(binary_name);
    let mut candidates = vec![base.clone()];
    if cfg!(windows) {
        candidates.insert(0, base.with_extension("exe"));
    }

    candidates
        .into_iter()
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| {
            DlxError::Configuration(format!(
                "Executable '{}' not found in '{}'.",
                binary_name,
                build_folder.display()
            ))
        })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Resolve `path` against the current directory without touching the
/// filesystem.
pub fn absolutize(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Everything an interactive session needs, frozen at startup.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: ServerEndpoint,
    pub binaries: Binaries,
    pub launch: ServerLaunch,
    pub connect_timeout: Duration,
    pub shutdown_grace: Duration,
}

/// Container section of the config file.
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ContainerFileConfig {
    pub runtime: Option<String>,
    pub image: Option<String>,
    pub platform: Option<String>,
}

/// On-disk configuration. Every field is optional.
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub host: Option<String>,
    pub request_port: Option<u16>,
    pub solution_port: Option<u16>,
    pub build_folder: Option<PathBuf>,
    pub connect_timeout_secs: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
    #[serde(default)]
    pub container: ContainerFileConfig,
}

impl FileConfig {
    /// Load from `path`, or defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// [`DlxError::Configuration`] if the file exists but cannot be read or
    /// parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            DlxError::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: FileConfig = serde_json::from_str(&contents).map_err(|e| {
            DlxError::Configuration(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// `<config_dir>/dlx-orchestrator/config.json`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dlx-orchestrator")
            .join("config.json")
    }
}

/// Values supplied on the command line (or via `DLX_*` variables).
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub request_port: Option<u16>,
    pub solution_port: Option<u16>,
    pub build_folder: Option<PathBuf>,
    pub container_image: Option<String>,
    pub container_runtime: Option<String>,
    pub platform: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
}

/// Settings before the build folder has been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSettings {
    pub endpoint: ServerEndpoint,
    pub build_folder: PathBuf,
    pub launch: ServerLaunch,
    pub connect_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl ResolvedSettings {
    /// Apply precedence: overrides, then file, then defaults.
    pub fn merge(overrides: Overrides, file: FileConfig) -> Self {
        let endpoint = ServerEndpoint::new(
            overrides
                .host
                .or(file.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            overrides
                .request_port
                .or(file.request_port)
                .unwrap_or(DEFAULT_REQUEST_PORT),
            overrides
                .solution_port
                .or(file.solution_port)
                .unwrap_or(DEFAULT_SOLUTION_PORT),
        );

        let launch = match overrides.container_image.or(file.container.image) {
            Some(image) => ServerLaunch::Container(ContainerSettings {
                runtime: overrides
                    .container_runtime
                    .or(file.container.runtime)
                    .unwrap_or_else(|| DEFAULT_CONTAINER_RUNTIME.to_string()),
                image,
                name: format!("dlx-orchestrator-{}", std::process::id()),
                platform: overrides.platform.or(file.container.platform),
            }),
            None => ServerLaunch::Local,
        };

        Self {
            endpoint,
            build_folder: overrides
                .build_folder
                .or(file.build_folder)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BUILD_FOLDER)),
            launch,
            connect_timeout: overrides
                .connect_timeout_secs
                .or(file.connect_timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            shutdown_grace: overrides
                .shutdown_grace_secs
                .or(file.shutdown_grace_secs)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_SHUTDOWN_GRACE),
        }
    }

    /// Resolve the executables and freeze into a [`SessionConfig`].
    pub fn into_session_config(self) -> Result<SessionConfig> {
        let binaries = Binaries::resolve(&self.build_folder)?;
        Ok(SessionConfig {
            endpoint: self.endpoint,
            binaries,
            launch: self.launch,
            connect_timeout: self.connect_timeout,
            shutdown_grace: self.shutdown_grace,
        })
    }
}
