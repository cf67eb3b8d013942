#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use edu_scheduler::clock::Clock;
use edu_scheduler::dispatcher::Dispatcher;
use edu_scheduler::types::{AppConfig, Command, ProgramName, RunId, RunKey};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

/// Writes `results/<run_id>/res.txt` containing "ok".
pub const WRITES_RESULT: &str = "mkdir -p results/$1\nprintf ok > results/$1/res.txt\necho done\n";
pub const LOOPS_FOREVER: &str = "while true; do sleep 0.05; done\n";
pub const IGNORES_SIGTERM: &str = "trap '' TERM\nwhile true; do :; done\n";
pub const EXITS_QUICKLY: &str = "exit 3\n";
/// Leaves a SIGTERM-immune descendant behind and waits on it; its pid lands in `child.pid`.
pub const SPAWNS_STUBBORN_CHILD: &str =
    "sh -c 'trap \"\" TERM; echo $$ > child.pid; while true; do :; done' &\nwait\n";
/// Exits at once, leaving a background sleeper whose pid lands in `child.pid`.
pub const ORPHANS_A_SLEEPER: &str = "sleep 30 &\necho $! > child.pid\nexit 0\n";

pub fn bundle(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in files {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn program(name: &str) -> ProgramName {
    ProgramName::new(name).unwrap()
}

pub fn run(program_name: &str, run_id: &str) -> RunKey {
    RunKey::new(program(program_name), RunId::new(run_id).unwrap())
}

pub fn store(name: &str, script: &str) -> Command {
    Command::StoreArchive {
        program: program(name),
        archive: bundle(&[("main.sh", script)]),
    }
}

/// Scheduler configuration rooted in `dir`, running `sh main.sh <run_id>`.
pub fn config(dir: &TempDir, timeout: Duration) -> AppConfig {
    AppConfig {
        port: 0,
        archives_path: dir.path().join("archives").to_string_lossy().into_owned(),
        data_path: dir.path().join("data").to_string_lossy().into_owned(),
        interpreter: "sh".to_string(),
        entry_point: "main.sh".to_string(),
        timeout_ms: timeout.as_millis() as u64,
        poll_samples: 10,
        reap_timeout_ms: 200,
        max_archive_bytes: 1024 * 1024,
        max_result_file_bytes: 1024 * 1024,
        memory_limit_kb: None,
        cpu_time_limit_secs: None,
        update_system_time: false,
    }
}

#[derive(Default)]
pub struct RecordingClock {
    pub calls: Mutex<Vec<i64>>,
}

impl Clock for RecordingClock {
    fn set_time(&self, epoch_secs: i64) -> Result<(), String> {
        if epoch_secs < 0 {
            return Err("negative epoch".to_string());
        }
        self.calls.lock().unwrap().push(epoch_secs);
        Ok(())
    }
}

pub fn dispatcher(dir: &TempDir, timeout: Duration) -> Dispatcher<RecordingClock> {
    edu_scheduler::build_dispatcher(&config(dir, timeout), RecordingClock::default()).unwrap()
}

/// Reads the pid a script left in `child.pid`, waiting for it to appear.
pub async fn child_pid(program_dir: &Path) -> u32 {
    let file = program_dir.join("child.pid");
    for _ in 0..50 {
        if let Ok(pid) = std::fs::read_to_string(&file) {
            if let Ok(pid) = pid.trim().parse() {
                return pid;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} never written", file.display());
}

/// True while `pid` exists and is not a zombie.
pub fn is_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // state is the first field after the parenthesised command name
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

/// Waits up to a second for `pid` to disappear.
pub async fn gone_soon(pid: u32) -> bool {
    for _ in 0..50 {
        if !is_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
