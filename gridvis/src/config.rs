use shared::{DimeSection, VisConfig};
use std::path::{Path, PathBuf};
use tokio::sync::oneshot;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("unsupported config version '{0}'")]
    UnsupportedVersion(String),
}

/// `<config dir>/gridvis/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("gridvis").join("config.toml"))
}

pub fn load_config(path: &Path) -> Result<VisConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: VisConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    if !config.app.is_supported_version() {
        return Err(ConfigError::UnsupportedVersion(config.app.version));
    }
    Ok(config)
}

/// Load `path`, or the default location when none is given. A missing file
/// yields the default configuration.
pub fn load_or_default(path: Option<&Path>) -> Result<VisConfig, ConfigError> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Some(path) => path,
            None => {
                log::info!("No config directory on this platform, using defaults");
                return Ok(VisConfig::default());
            }
        },
    };

    if !path.exists() {
        log::info!("No config at {}, using defaults", path.display());
        return Ok(VisConfig::default());
    }
    let config = load_config(&path)?;
    log::info!("Loaded config from {}", path.display());
    Ok(config)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimeEndpoint {
    pub host: String,
    pub port: u16,
}

impl DimeEndpoint {
    pub fn from_config(dime: &DimeSection) -> Option<Self> {
        Some(Self {
            host: dime.host.clone()?,
            port: dime.port?,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("host must not be empty")]
    EmptyHost,
    #[error("'{0}' is not a valid port number")]
    InvalidPort(String),
    #[error("endpoint was already submitted")]
    AlreadySubmitted,
    #[error("nobody is waiting for the endpoint any more")]
    Abandoned,
}

/// Endpoint entry that resolves its receiver exactly once. Invalid input
/// leaves the prompt open for another attempt.
#[derive(Debug)]
pub struct EndpointPrompt {
    sender: Option<oneshot::Sender<DimeEndpoint>>,
}

impl EndpointPrompt {
    pub fn new() -> (Self, oneshot::Receiver<DimeEndpoint>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_some()
    }

    pub fn submit(&mut self, host: &str, port: &str) -> Result<DimeEndpoint, EndpointError> {
        if self.sender.is_none() {
            return Err(EndpointError::AlreadySubmitted);
        }
        let host = host.trim();
        if host.is_empty() {
            return Err(EndpointError::EmptyHost);
        }
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| EndpointError::InvalidPort(port.trim().to_string()))?;

        let endpoint = DimeEndpoint {
            host: host.to_string(),
            port,
        };
        let sender = self.sender.take().ok_or(EndpointError::AlreadySubmitted)?;
        sender
            .send(endpoint.clone())
            .map_err(|_| EndpointError::Abandoned)?;
        Ok(endpoint)
    }
}
