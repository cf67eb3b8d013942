use std::time::Instant;

use metrics::{counter, histogram};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::archive::ArchiveStore;
use crate::clock::Clock;
use crate::error::CommandError;
use crate::results::ResultPackager;
use crate::supervisor::Supervisor;
use crate::types::{Command, ProgramName, Response, RunKey, StatusReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherState {
    Idle,
    Processing,
}

/// Maps each decoded command onto exactly one component operation. One command is
/// processed at a time; a command arriving while another is in flight gets `Busy`.
pub struct Dispatcher<C> {
    archives: ArchiveStore,
    results: ResultPackager,
    supervisor: Supervisor,
    clock: C,
    in_flight: Mutex<()>,
}

impl<C: Clock> Dispatcher<C> {
    pub fn new(
        archives: ArchiveStore,
        results: ResultPackager,
        supervisor: Supervisor,
        clock: C,
    ) -> Self {
        Self {
            archives,
            results,
            supervisor,
            clock,
            in_flight: Mutex::new(()),
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn state(&self) -> DispatcherState {
        match self.in_flight.try_lock() {
            Ok(_) => DispatcherState::Idle,
            Err(_) => DispatcherState::Processing,
        }
    }

    pub async fn dispatch(&self, command: Command) -> Result<Response, CommandError> {
        let tag = command.tag();
        let Ok(_processing) = self.in_flight.try_lock() else {
            tracing::warn!("rejecting {}: another command is in flight", tag.name());
            counter!("commands_total", "command" => tag.name(), "outcome" => "busy").increment(1);
            return Err(CommandError::Busy);
        };

        tracing::info!("processing command {} ({:#x})", tag.name(), tag as u8);
        let started = Instant::now();
        let result = self.handle(command).await;
        histogram!("command_duration_ms", "command" => tag.name())
            .record(started.elapsed().as_millis() as f64);

        match &result {
            Ok(_) => {
                tracing::info!("command {} completed", tag.name());
                counter!("commands_total", "command" => tag.name(), "outcome" => "ok").increment(1);
            }
            Err(e) => {
                tracing::error!("command {} failed: {}", tag.name(), e);
                counter!("commands_total", "command" => tag.name(), "outcome" => e.kind())
                    .increment(1);
            }
        }

        result
    }

    async fn handle(&self, command: Command) -> Result<Response, CommandError> {
        match command {
            Command::NoOp => Ok(Response::Ack),
            Command::StoreArchive { program, archive } => {
                self.store_archive(program, archive).await?;
                Ok(Response::Ack)
            }
            Command::Execute(RunKey { program, run_id }) => {
                self.supervisor.execute(&program, &run_id).await?;
                Ok(Response::Ack)
            }
            Command::Stop(run) => {
                if let Some(current) = self.supervisor.status().current {
                    if current != run {
                        tracing::warn!("stop names {} but {} is active, stopping it", run, current);
                    }
                }
                self.supervisor.stop().await?;
                Ok(Response::Ack)
            }
            Command::SendResults(RunKey { program, run_id }) => {
                let results = self.results.clone();
                let path = tokio::task::spawn_blocking(move || results.collect(&program, &run_id))
                    .await
                    .map_err(|e| CommandError::CollectFailed(e.to_string()))??;
                Ok(Response::Artifact { path })
            }
            Command::ListFiles => {
                let archives = self.archives.clone();
                let programs = tokio::task::spawn_blocking(move || archives.list())
                    .await
                    .map_err(|e| CommandError::Io(std::io::Error::other(e)))??;
                Ok(Response::Programs { programs })
            }
            Command::UpdateTime { epoch } => {
                self.clock
                    .set_time(epoch)
                    .map_err(CommandError::TimeUpdateFailed)?;
                Ok(Response::Ack)
            }
            Command::GetStatus => Ok(Response::Status(self.status_report(true)?)),
        }
    }

    async fn store_archive(
        &self,
        program: ProgramName,
        archive: Vec<u8>,
    ) -> Result<(), CommandError> {
        if self.supervisor.active_program().as_ref() == Some(&program) {
            return Err(CommandError::ArchiveInUse(program.to_string()));
        }

        let archives = self.archives.clone();
        tokio::task::spawn_blocking(move || archives.store(&program, &archive))
            .await
            .map_err(|e| CommandError::StoreFailed(e.to_string()))?
    }

    /// Current flags plus, when `consume` is set, the oldest finished run.
    pub fn status_report(&self, consume: bool) -> Result<StatusReport, CommandError> {
        let status = self.supervisor.status();
        let events = self.supervisor.events();
        let finished = if consume { events.pop()? } else { None };

        Ok(StatusReport {
            running: status.running,
            last_run_was_killed: status.last_run_was_killed,
            current: status.current,
            data_ready: !events.is_empty(),
            finished,
        })
    }
}
