use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};

use crate::clock::SystemClock;
use crate::dispatcher::Dispatcher;
use crate::error::CommandError;
use crate::supervisor::SupervisorConfig;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_archives_path")]
    pub archives_path: String,
    #[serde(default = "default_data_path")]
    pub data_path: String,
    #[serde(default = "default_interpreter")]
    pub interpreter: String, // empty runs the entry point directly
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_poll_samples")]
    pub poll_samples: u32,
    #[serde(default = "default_reap_timeout_ms")]
    pub reap_timeout_ms: u64,
    #[serde(default = "default_max_archive_bytes")]
    pub max_archive_bytes: u64, // extracted size
    #[serde(default = "default_max_result_file_bytes")]
    pub max_result_file_bytes: u64,
    #[serde(default)]
    pub memory_limit_kb: Option<u64>,
    #[serde(default)]
    pub cpu_time_limit_secs: Option<u64>,
    #[serde(default = "default_update_system_time")]
    pub update_system_time: bool,
}

fn default_port() -> u16 {
    8080
}

fn default_archives_path() -> String {
    "./archives".to_string()
}

fn default_data_path() -> String {
    "./data".to_string()
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_entry_point() -> String {
    "main.py".to_string()
}

fn default_timeout_ms() -> u64 {
    600_000
}

fn default_poll_samples() -> u32 {
    10
}

fn default_reap_timeout_ms() -> u64 {
    200
}

fn default_max_archive_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_max_result_file_bytes() -> u64 {
    1_000_000
}

fn default_update_system_time() -> bool {
    true
}

impl AppConfig {
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            archives_dir: PathBuf::from(&self.archives_path),
            data_dir: PathBuf::from(&self.data_path),
            interpreter: Some(self.interpreter.clone()).filter(|i| !i.is_empty()),
            entry_point: self.entry_point.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
            poll_samples: self.poll_samples,
            reap_timeout: Duration::from_millis(self.reap_timeout_ms),
            memory_limit_kb: self.memory_limit_kb,
            cpu_time_limit_secs: self.cpu_time_limit_secs,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher<SystemClock>>,
    pub prometheus_handle: PrometheusHandle,
}

const MAX_IDENTIFIER_LEN: usize = 64;

fn validate_identifier(value: &str) -> Result<(), CommandError> {
    let valid = !value.is_empty()
        && value.len() <= MAX_IDENTIFIER_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');

    if valid {
        Ok(())
    } else {
        Err(CommandError::InvalidIdentifier(value.to_string()))
    }
}

/// Name of a stored program. Doubles as the name of its directory under the archive root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProgramName(String);

impl ProgramName {
    pub fn new(value: impl Into<String>) -> Result<Self, CommandError> {
        let value = value.into();
        validate_identifier(&value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Caller-supplied token naming one run of a program.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    pub fn new(value: impl Into<String>) -> Result<Self, CommandError> {
        let value = value.into();
        validate_identifier(&value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! identifier_conversions {
    ($ty:ty) => {
        impl TryFrom<String> for $ty {
            type Error = CommandError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$ty> for String {
            fn from(value: $ty) -> Self {
                value.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

identifier_conversions!(ProgramName);
identifier_conversions!(RunId);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunKey {
    pub program: ProgramName,
    pub run_id: RunId,
}

impl RunKey {
    pub fn new(program: ProgramName, run_id: RunId) -> Self {
        Self { program, run_id }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.program, self.run_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandTag {
    NoOp = 0,
    StoreArchive = 1,
    Execute = 2,
    Stop = 3,
    SendResults = 4,
    ListFiles = 5,
    UpdateTime = 6,
    GetStatus = 7,
}

impl CommandTag {
    pub fn name(self) -> &'static str {
        match self {
            CommandTag::NoOp => "no_op",
            CommandTag::StoreArchive => "store_archive",
            CommandTag::Execute => "execute",
            CommandTag::Stop => "stop",
            CommandTag::SendResults => "send_results",
            CommandTag::ListFiles => "list_files",
            CommandTag::UpdateTime => "update_time",
            CommandTag::GetStatus => "get_status",
        }
    }
}

impl TryFrom<u8> for CommandTag {
    type Error = CommandError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => CommandTag::NoOp,
            1 => CommandTag::StoreArchive,
            2 => CommandTag::Execute,
            3 => CommandTag::Stop,
            4 => CommandTag::SendResults,
            5 => CommandTag::ListFiles,
            6 => CommandTag::UpdateTime,
            7 => CommandTag::GetStatus,
            other => return Err(CommandError::UnknownCommand(other)),
        })
    }
}

/// A decoded command together with its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    NoOp,
    StoreArchive {
        program: ProgramName,
        #[serde(with = "base64_bytes")]
        archive: Vec<u8>,
    },
    Execute(RunKey),
    Stop(RunKey),
    SendResults(RunKey),
    ListFiles,
    UpdateTime {
        epoch: i64, // seconds since the unix epoch
    },
    GetStatus,
}

impl Command {
    pub fn tag(&self) -> CommandTag {
        match self {
            Command::NoOp => CommandTag::NoOp,
            Command::StoreArchive { .. } => CommandTag::StoreArchive,
            Command::Execute(_) => CommandTag::Execute,
            Command::Stop(_) => CommandTag::Stop,
            Command::SendResults(_) => CommandTag::SendResults,
            Command::ListFiles => CommandTag::ListFiles,
            Command::UpdateTime { .. } => CommandTag::UpdateTime,
            Command::GetStatus => CommandTag::GetStatus,
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Record of a finished run, queued until the OBC picks it up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub program: ProgramName,
    pub run_id: RunId,
    pub exit_code: Option<i32>, // None when terminated by a signal
    pub killed: bool,
    pub wall_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub running: bool,
    pub last_run_was_killed: bool,
    pub current: Option<RunKey>,
    pub data_ready: bool,
    pub finished: Option<RunStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ack,
    Programs { programs: Vec<ProgramName> },
    Artifact { path: PathBuf },
    Status(StatusReport),
}

/// Exactly one of these goes back upstream for every command.
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Ok { response: Response },
    Error { kind: String, message: String },
}

impl From<Result<Response, CommandError>> for Outcome {
    fn from(result: Result<Response, CommandError>) -> Self {
        match result {
            Ok(response) => Outcome::Ok { response },
            Err(e) => Outcome::Error {
                kind: e.kind().to_string(),
                message: e.to_string(),
            },
        }
    }
}
