mod common;

use std::fs::{self, File};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use edu_scheduler::dispatcher::DispatcherState;
use edu_scheduler::error::CommandError;
use edu_scheduler::types::{Command, Response};
use tempfile::TempDir;
use zip::ZipArchive;

fn read_entry(path: &std::path::Path, name: &str) -> String {
    let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut content = String::new();
    archive
        .by_name(name)
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    content
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_execute_collect() {
    let dir = TempDir::new().unwrap();
    let dispatcher = dispatcher(&dir, Duration::from_secs(5));

    let response = dispatcher.dispatch(store("arch1", WRITES_RESULT)).await.unwrap();
    assert_eq!(response, Response::Ack);

    let response = dispatcher
        .dispatch(Command::Execute(run("arch1", "0001")))
        .await
        .unwrap();
    assert_eq!(response, Response::Ack);

    tokio::time::timeout(Duration::from_secs(5), dispatcher.supervisor().wait_idle())
        .await
        .unwrap();

    let response = dispatcher
        .dispatch(Command::SendResults(run("arch1", "0001")))
        .await
        .unwrap();
    let Response::Artifact { path } = response else {
        panic!("expected an artifact, got {:?}", response);
    };
    assert_eq!(path, dir.path().join("data/arch1_0001.zip"));
    assert_eq!(read_entry(&path, "res.txt"), "ok");
    assert_eq!(read_entry(&path, "program.log").trim(), "done");

    // collecting again rewrites the same artifact
    let again = dispatcher
        .dispatch(Command::SendResults(run("arch1", "0001")))
        .await
        .unwrap();
    assert_eq!(again, Response::Artifact { path: path.clone() });
    assert_eq!(read_entry(&path, "res.txt"), "ok");
}

#[tokio::test]
async fn collecting_unknown_run_creates_no_artifact() {
    let dir = TempDir::new().unwrap();
    let dispatcher = dispatcher(&dir, Duration::from_secs(1));
    dispatcher.dispatch(store("arch1", WRITES_RESULT)).await.unwrap();

    let result = dispatcher
        .dispatch(Command::SendResults(run("arch1", "9999")))
        .await;
    assert!(matches!(result, Err(CommandError::ResultNotFound { .. })));
    assert!(!dir.path().join("data/arch1_9999.zip").exists());
}

#[tokio::test]
async fn stored_program_is_listed_once_with_identical_contents() {
    let dir = TempDir::new().unwrap();
    let dispatcher = dispatcher(&dir, Duration::from_secs(1));

    let files = [("main.sh", "echo hi\n"), ("lib/util.sh", "helper() { :; }\n")];
    let archive = bundle(&files);
    for _ in 0..2 {
        dispatcher
            .dispatch(Command::StoreArchive {
                program: program("arch1"),
                archive: archive.clone(),
            })
            .await
            .unwrap();
    }
    dispatcher.dispatch(store("other", EXITS_QUICKLY)).await.unwrap();

    let response = dispatcher.dispatch(Command::ListFiles).await.unwrap();
    assert_eq!(
        response,
        Response::Programs {
            programs: vec![program("arch1"), program("other")]
        }
    );

    for (name, content) in files {
        let stored = fs::read_to_string(dir.path().join("archives/arch1").join(name)).unwrap();
        assert_eq!(stored, content);
    }
}

#[tokio::test]
async fn second_upload_replaces_the_first() {
    let dir = TempDir::new().unwrap();
    let dispatcher = dispatcher(&dir, Duration::from_secs(1));

    dispatcher
        .dispatch(Command::StoreArchive {
            program: program("arch1"),
            archive: bundle(&[("main.sh", "echo v1\n"), ("old.txt", "stale")]),
        })
        .await
        .unwrap();
    dispatcher
        .dispatch(Command::StoreArchive {
            program: program("arch1"),
            archive: bundle(&[("main.sh", "echo v2\n")]),
        })
        .await
        .unwrap();

    let program_dir = dir.path().join("archives/arch1");
    assert!(!program_dir.join("old.txt").exists());
    assert_eq!(
        fs::read_to_string(program_dir.join("main.sh")).unwrap(),
        "echo v2\n"
    );
}

#[tokio::test]
async fn corrupt_upload_never_becomes_live() {
    let dir = TempDir::new().unwrap();
    let dispatcher = dispatcher(&dir, Duration::from_secs(1));

    let result = dispatcher
        .dispatch(Command::StoreArchive {
            program: program("broken"),
            archive: b"definitely not a zip".to_vec(),
        })
        .await;
    assert!(matches!(result, Err(CommandError::StoreFailed(_))));
    assert!(!dir.path().join("archives/broken").exists());

    // a bad replacement leaves the previous upload in place
    dispatcher.dispatch(store("arch1", EXITS_QUICKLY)).await.unwrap();
    let mut truncated = bundle(&[("main.sh", "echo v2\n")]);
    truncated.truncate(truncated.len() / 2);
    let result = dispatcher
        .dispatch(Command::StoreArchive {
            program: program("arch1"),
            archive: truncated,
        })
        .await;
    assert!(matches!(result, Err(CommandError::StoreFailed(_))));
    assert_eq!(
        fs::read_to_string(dir.path().join("archives/arch1/main.sh")).unwrap(),
        EXITS_QUICKLY
    );

    let response = dispatcher.dispatch(Command::ListFiles).await.unwrap();
    assert_eq!(
        response,
        Response::Programs {
            programs: vec![program("arch1")]
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn running_program_archive_cannot_be_replaced() {
    let dir = TempDir::new().unwrap();
    let dispatcher = dispatcher(&dir, Duration::from_secs(10));
    dispatcher.dispatch(store("loop", LOOPS_FOREVER)).await.unwrap();
    dispatcher
        .dispatch(Command::Execute(run("loop", "1")))
        .await
        .unwrap();

    let result = dispatcher.dispatch(store("loop", EXITS_QUICKLY)).await;
    assert!(matches!(result, Err(CommandError::ArchiveInUse(_))));
    assert_eq!(
        fs::read_to_string(dir.path().join("archives/loop/main.sh")).unwrap(),
        LOOPS_FOREVER
    );

    // other programs may still be uploaded
    dispatcher.dispatch(store("other", EXITS_QUICKLY)).await.unwrap();

    let response = dispatcher
        .dispatch(Command::Stop(run("loop", "1")))
        .await
        .unwrap();
    assert_eq!(response, Response::Ack);
    assert!(dispatcher.supervisor().last_run_was_killed());

    dispatcher.dispatch(store("loop", EXITS_QUICKLY)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn execute_returns_before_the_program_finishes() {
    let dir = TempDir::new().unwrap();
    let dispatcher = dispatcher(&dir, Duration::from_secs(10));
    dispatcher.dispatch(store("loop", LOOPS_FOREVER)).await.unwrap();

    dispatcher
        .dispatch(Command::Execute(run("loop", "1")))
        .await
        .unwrap();
    assert!(dispatcher.supervisor().is_running());
    assert_eq!(dispatcher.state(), DispatcherState::Idle);

    let second = dispatcher.dispatch(Command::Execute(run("loop", "2"))).await;
    assert!(matches!(second, Err(CommandError::AlreadyRunning)));

    dispatcher
        .dispatch(Command::Stop(run("loop", "1")))
        .await
        .unwrap();
    let stopped_again = dispatcher.dispatch(Command::Stop(run("loop", "1"))).await;
    assert!(matches!(stopped_again, Err(CommandError::NotRunning)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_commands_are_rejected() {
    let dir = TempDir::new().unwrap();
    let dispatcher = Arc::new(dispatcher(&dir, Duration::from_secs(30)));
    dispatcher.dispatch(store("stubborn", IGNORES_SIGTERM)).await.unwrap();
    dispatcher
        .dispatch(Command::Execute(run("stubborn", "1")))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // stopping a SIGTERM-ignoring program takes at least one reap timeout
    let stopping = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.dispatch(Command::Stop(run("stubborn", "1"))).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(dispatcher.state(), DispatcherState::Processing);
    let overlapping = dispatcher.dispatch(Command::NoOp).await;
    assert!(matches!(overlapping, Err(CommandError::Busy)));

    assert_eq!(stopping.await.unwrap().unwrap(), Response::Ack);
    assert_eq!(dispatcher.dispatch(Command::NoOp).await.unwrap(), Response::Ack);
}

#[tokio::test]
async fn update_time_goes_through_the_clock() {
    let dir = TempDir::new().unwrap();
    let dispatcher = dispatcher(&dir, Duration::from_secs(1));

    let response = dispatcher
        .dispatch(Command::UpdateTime { epoch: 1_700_000_000 })
        .await
        .unwrap();
    assert_eq!(response, Response::Ack);
    assert_eq!(*dispatcher.clock().calls.lock().unwrap(), vec![1_700_000_000]);

    let result = dispatcher.dispatch(Command::UpdateTime { epoch: -1 }).await;
    assert!(matches!(result, Err(CommandError::TimeUpdateFailed(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_status_reports_finished_runs_once() {
    let dir = TempDir::new().unwrap();
    let dispatcher = dispatcher(&dir, Duration::from_secs(5));
    dispatcher.dispatch(store("quick", EXITS_QUICKLY)).await.unwrap();

    let Response::Status(idle) = dispatcher.dispatch(Command::GetStatus).await.unwrap() else {
        panic!("expected a status report");
    };
    assert!(!idle.running);
    assert!(!idle.data_ready);
    assert!(idle.finished.is_none());

    dispatcher
        .dispatch(Command::Execute(run("quick", "7")))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), dispatcher.supervisor().wait_idle())
        .await
        .unwrap();
    assert!(dispatcher.status_report(false).unwrap().data_ready);

    let Response::Status(report) = dispatcher.dispatch(Command::GetStatus).await.unwrap() else {
        panic!("expected a status report");
    };
    let finished = report.finished.expect("finished run should be reported");
    assert_eq!(finished.run_id.as_str(), "7");
    assert_eq!(finished.exit_code, Some(3));
    assert!(!report.data_ready);
    assert!(!report.last_run_was_killed);
}

#[tokio::test]
async fn no_op_is_acknowledged() {
    let dir = TempDir::new().unwrap();
    let dispatcher = dispatcher(&dir, Duration::from_secs(1));
    assert_eq!(dispatcher.dispatch(Command::NoOp).await.unwrap(), Response::Ack);
    assert_eq!(dispatcher.state(), DispatcherState::Idle);
}
