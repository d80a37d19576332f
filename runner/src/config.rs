use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    str::FromStr,
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, warn};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_DATABASE: &str = "postgres";
pub const DEFAULT_USER: &str = "postgres";
pub const DEFAULT_TOOL: &str = "pgbench";
pub const DEFAULT_CLIENTS: [u32; 9] = [1, 2, 4, 8, 16, 32, 64, 128, 256];

// keys of the flattened sections, aliases included, serde can't deny unknown ones through flatten
const TARGET_FIELDS: [&str; 7] = ["host", "port", "dbname", "db", "user", "username", "password"];
const RUN_FIELDS: [&str; 5] = ["mode", "threads", "clients", "comment", "timeout"];
const INIT_FIELDS: [&str; 2] = ["scale", "fill"];

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("unknown benchmark mode: {0:?}")]
    UnknownMode(String),
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),
    #[error("file not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("failed to parse config file")]
    Parse(#[from] serde_yaml::Error),
    #[error("unknown field {field:?} in the {section} section")]
    UnknownField {
        section: &'static str,
        field: String,
    },
    #[error("config file contains errors, see log for details")]
    Preflight,
}

/// Benchmarking mode, decides on total duration and sampling cadence
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Simple,
    Thorough,
}

/// Parameters derived from a `Mode`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModeParameters {
    /// value passed to the tool as `-T`
    pub duration: Duration,
    /// cadence of the resource sampler
    pub sampling: Duration,
    /// number of samples a run is expected to collect, used for preallocation
    pub expected_samples: usize,
}

impl Mode {
    pub fn parameters(self) -> ModeParameters {
        match self {
            Self::Simple => ModeParameters {
                duration: Duration::from_secs(5),
                sampling: Duration::from_secs(1),
                expected_samples: 5,
            },
            Self::Thorough => ModeParameters {
                duration: Duration::from_secs(600),
                sampling: Duration::from_secs(30),
                expected_samples: 20,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Thorough => "thorough",
        }
    }
}

impl FromStr for Mode {
    type Err = ConfigErrors;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "simple" => Ok(Self::Simple),
            "thorough" => Ok(Self::Thorough),
            _ => Err(ConfigErrors::UnknownMode(s.to_owned())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection target and credentials shared by the run and init paths
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct TargetConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default, alias = "db")]
    pub dbname: Option<String>,
    #[serde(default, alias = "username")]
    pub user: Option<String>,
    // never serialized back, only forwarded to the child process
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl TargetConfig {
    pub fn sanitize(&mut self) {
        fill(&mut self.host, DEFAULT_HOST);
        fill(&mut self.dbname, DEFAULT_DATABASE);
        fill(&mut self.user, DEFAULT_USER);
        self.port.get_or_insert(DEFAULT_PORT);
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_HOST)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn dbname(&self) -> &str {
        self.dbname.as_deref().unwrap_or(DEFAULT_DATABASE)
    }

    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or(DEFAULT_USER)
    }
}

fn fill(value: &mut Option<String>, default: &str) {
    if value.as_deref().map_or(true, str::is_empty) {
        *value = Some(default.to_owned());
    }
}

/// Input for one run of the load generation tool
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct RunConfig {
    #[serde(flatten)]
    pub target: TargetConfig,
    // kept as text until the run starts, an unknown mode fails before anything is spawned
    #[serde(default)]
    pub mode: Option<String>,
    // 0 selects all available cores
    #[serde(default)]
    pub threads: Option<u32>,
    #[serde(default)]
    pub clients: Option<u32>,
    #[serde(default)]
    pub comment: Option<String>,
    // seconds after which the tool is killed, unbounded if unset
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl RunConfig {
    /// fill all missing fields with their defaults, never fails
    pub fn sanitize(&mut self) {
        self.target.sanitize();

        if self.mode.as_deref().map_or(true, str::is_empty) {
            self.mode = Some(Mode::default().as_str().to_owned());
        }

        self.threads = Some(match self.threads {
            None => 1,
            Some(0) => thread::available_parallelism().map_or(1, |n| n.get() as u32),
            Some(threads) => threads,
        });

        self.clients = Some(self.clients.unwrap_or(1).max(1));
    }

    pub fn mode(&self) -> Result<Mode, ConfigErrors> {
        match self.mode.as_deref() {
            None | Some("") => Ok(Mode::default()),
            Some(mode) => mode.parse(),
        }
    }

    pub fn threads(&self) -> u32 {
        self.threads.unwrap_or(1)
    }

    pub fn clients(&self) -> u32 {
        self.clients.unwrap_or(1)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

/// Input for preparing a target database
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct InitConfig {
    #[serde(flatten)]
    pub target: TargetConfig,
    #[serde(default)]
    pub scale: Option<u32>,
    #[serde(default)]
    pub fill: Option<u32>,
}

impl InitConfig {
    pub fn sanitize(&mut self) {
        self.target.sanitize();
        self.scale = Some(self.scale.unwrap_or(1).clamp(1, 1000));
        self.fill = Some(match self.fill {
            Some(fill) if (10..=100).contains(&fill) => fill,
            _ => 100,
        });
    }

    pub fn scale(&self) -> u32 {
        self.scale.unwrap_or(1)
    }

    pub fn fill(&self) -> u32 {
        self.fill.unwrap_or(100)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Top level config file
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default = "default_tool")]
    pub tool: PathBuf,
    #[serde(default, alias = "db")]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub init: InitConfig,
    #[serde(default = "default_clients")]
    pub clients: Vec<u32>,
    // opt in, collects a host description for every stored benchmark
    #[serde(default)]
    pub system_info: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tool: default_tool(),
            database: DatabaseConfig::default(),
            run: RunConfig::default(),
            init: InitConfig::default(),
            clients: default_clients(),
            system_info: false,
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path).map_err(|error| match error.kind() {
            std::io::ErrorKind::NotFound => ConfigErrors::FileNotFound(path.to_path_buf()),
            _ => ConfigErrors::MetadataNotFound(error),
        })?;
        let document: serde_yaml::Value = serde_yaml::from_reader(file)?;
        check_section(&document, "run", &RUN_FIELDS)?;
        check_section(&document, "init", &INIT_FIELDS)?;
        let config: Self = serde_yaml::from_value(document)?;

        debug!(path = ?path, "Loaded config file");

        Ok(config)
    }

    /// attempt to catch all errors instead of piece-by-piece to make debugging easier for users
    pub fn preflight_checks(&mut self) -> bool {
        let mut contains_error = false;

        if let Some(mode) = self.run.mode.as_deref() {
            if let Err(error) = mode.parse::<Mode>() {
                error!("run.mode: {error}");
                contains_error = true;
            }
        }

        if self.clients.is_empty() {
            warn!("No client counts were given, falling back to the default set");
            self.clients = default_clients();
        } else if self.clients.contains(&0) {
            error!("clients cannot contain 0, a run needs at least one client");
            contains_error = true;
        }

        if self.run.timeout == Some(0) {
            error!("run.timeout cannot be 0, leave it unset for an unbounded run");
            contains_error = true;
        }

        // explicit paths are checked here, bare names are resolved through PATH by the OS
        if self.tool.components().count() > 1 {
            match check_executable(&self.tool) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "Tool {} is not executable, this might cause problems",
                        self.tool.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to determine if tool ({}) is an executable: {e}",
                        self.tool.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        }

        contains_error
    }
}

/// Reject keys of `section` that are neither connection settings nor one of `fields`
fn check_section(
    document: &serde_yaml::Value,
    section: &'static str,
    fields: &[&str],
) -> Result<(), ConfigErrors> {
    let Some(mapping) = document.get(section).and_then(serde_yaml::Value::as_mapping) else {
        return Ok(());
    };

    for key in mapping.keys() {
        match key.as_str() {
            Some(name) if TARGET_FIELDS.contains(&name) || fields.contains(&name) => {}
            Some(name) => {
                return Err(ConfigErrors::UnknownField {
                    section,
                    field: name.to_owned(),
                })
            }
            None => {
                return Err(ConfigErrors::UnknownField {
                    section,
                    field: format!("{key:?}"),
                })
            }
        }
    }

    Ok(())
}

fn default_tool() -> PathBuf {
    PathBuf::from(DEFAULT_TOOL)
}

fn default_clients() -> Vec<u32> {
    DEFAULT_CLIENTS.to_vec()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("pgmark.db")
}
