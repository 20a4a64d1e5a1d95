use crate::errors::ConfigError;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::{fmt, path::PathBuf, str::FromStr};

/// Identifier of a container, also the name of its state directory
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerId {
    serialized: String,
}

impl ContainerId {
    pub fn as_str(&self) -> &str {
        &self.serialized
    }

    /// Parse a user-supplied name as a [ContainerId]
    ///
    /// Ids start with an alphanumeric character and continue with
    /// alphanumerics, underscores, dots, or dashes, so they are always a
    /// single safe path component.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        lazy_static! {
            static ref RE: Regex = Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]{0,127}$").unwrap();
        }
        match RE.is_match(s) {
            false => Err(ConfigError::InvalidContainerId(s.to_owned())),
            true => Ok(ContainerId {
                serialized: s.to_owned(),
            }),
        }
    }

    /// A fresh id made of 8 random lowercase hex digits
    pub fn generate() -> Self {
        ContainerId {
            serialized: format!("{:08x}", rand::random::<u32>()),
        }
    }
}

impl FromStr for ContainerId {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContainerId::parse(s)
    }
}

impl std::convert::TryFrom<String> for ContainerId {
    type Error = ConfigError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        ContainerId::parse(&s)
    }
}

impl From<ContainerId> for String {
    fn from(id: ContainerId) -> String {
        id.serialized
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Debug for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Lifecycle state stored in a container record
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Stopped,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_security_profile() -> String {
    "default".to_owned()
}

/// Durable state of one container, stored as `config.json` in its directory
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: ContainerId,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub cpu: String,
    pub log_file: PathBuf,
    #[serde(default = "default_security_profile")]
    pub security_profile: String,
}

impl ContainerRecord {
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    /// Volume names this record mounts, in order
    pub fn volume_names(&self) -> impl Iterator<Item = &str> {
        self.volumes
            .iter()
            .filter_map(|spec| spec.split(':').next())
    }
}
