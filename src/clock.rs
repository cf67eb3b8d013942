use std::process::Command;

/// Process-wide wall clock. `UpdateTime` hands the OBC's time to whatever implements this.
pub trait Clock: Send + Sync {
    fn set_time(&self, epoch_secs: i64) -> Result<(), String>;
}

pub struct SystemClock {
    enabled: bool,
}

impl SystemClock {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl Clock for SystemClock {
    fn set_time(&self, epoch_secs: i64) -> Result<(), String> {
        if !self.enabled {
            tracing::info!("system time update to {} skipped (disabled)", epoch_secs);
            return Ok(());
        }

        let status = Command::new("date")
            .arg("-s")
            .arg(format!("@{}", epoch_secs))
            .status()
            .map_err(|e| format!("failed to run date: {}", e))?;

        if !status.success() {
            return Err(format!("date exited with {}", status));
        }

        tracing::info!("system time set to {}", epoch_secs);
        Ok(())
    }
}
