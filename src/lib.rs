//! Payload scheduler for the EDU: stores uploaded experiment programs, runs one at a time
//! under a timeout watchdog, and packages their results for the OBC.

pub mod archive;
pub mod clock;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod handlers;
pub mod results;
pub mod supervisor;
pub mod system_monitor;
pub mod types;

use std::path::Path;

use crate::archive::ArchiveStore;
use crate::clock::Clock;
use crate::dispatcher::Dispatcher;
use crate::events::EventQueue;
use crate::results::ResultPackager;
use crate::supervisor::Supervisor;
use crate::types::AppConfig;

/// Wires the components described by `config` into a dispatcher.
pub fn build_dispatcher<C: Clock>(
    config: &AppConfig,
    clock: C,
) -> std::io::Result<Dispatcher<C>> {
    std::fs::create_dir_all(&config.archives_path)?;
    std::fs::create_dir_all(&config.data_path)?;

    let events = EventQueue::open(Path::new(&config.data_path).join("events.json"))?;
    let supervisor = Supervisor::new(config.supervisor_config(), events);
    let archives = ArchiveStore::new(&config.archives_path, config.max_archive_bytes);
    let results = ResultPackager::new(
        &config.archives_path,
        &config.data_path,
        config.max_result_file_bytes,
    );

    Ok(Dispatcher::new(archives, results, supervisor, clock))
}
