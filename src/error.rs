use thiserror::Error;

/// Every way a command can fail. Each variant is recovered into an outcome for the
/// caller; none of them stop the scheduler.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),

    #[error("failed to store archive: {0}")]
    StoreFailed(String),

    #[error("program {0} is currently running, its archive cannot be replaced")]
    ArchiveInUse(String),

    #[error("a program is already running")]
    AlreadyRunning,

    #[error("no program is running")]
    NotRunning,

    #[error("no result for {program}:{run_id}")]
    ResultNotFound { program: String, run_id: String },

    #[error("failed to collect result: {0}")]
    CollectFailed(String),

    #[error("failed to launch program: {0}")]
    ProcessLaunchFailed(String),

    #[error("failed to update system time: {0}")]
    TimeUpdateFailed(String),

    #[error("another command is being processed")]
    Busy,

    #[error("unknown command {0:#x}")]
    UnknownCommand(u8),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CommandError {
    /// Stable label for wire outcomes and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            CommandError::InvalidIdentifier(_) => "invalid_identifier",
            CommandError::StoreFailed(_) => "store_failed",
            CommandError::ArchiveInUse(_) => "archive_in_use",
            CommandError::AlreadyRunning => "already_running",
            CommandError::NotRunning => "not_running",
            CommandError::ResultNotFound { .. } => "result_not_found",
            CommandError::CollectFailed(_) => "collect_failed",
            CommandError::ProcessLaunchFailed(_) => "process_launch_failed",
            CommandError::TimeUpdateFailed(_) => "time_update_failed",
            CommandError::Busy => "busy",
            CommandError::UnknownCommand(_) => "unknown_command",
            CommandError::Io(_) => "io",
        }
    }
}
