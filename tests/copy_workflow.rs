use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;

use nasfilecopy::adapters::SimulatedAdapter;
use nasfilecopy::config::AppConfig;
use nasfilecopy::context::AppContext;
use nasfilecopy::core::transfer_engine::{SimulatedEngine, TransferRequest};
use nasfilecopy::core::{CopyOutcome, CopyRequest, ExitCode, Orchestrator};
use tempfile::TempDir;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

struct Host {
    _dir: TempDir,
    root: PathBuf,
    lock_path: PathBuf,
    adapter: Arc<SimulatedAdapter>,
    engine: SimulatedEngine,
}

impl Host {
    fn new() -> Self {
        Self::with_engine(SimulatedEngine::default())
    }

    fn with_engine(engine: SimulatedEngine) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("mnt");
        std::fs::create_dir(&root).unwrap();
        let lock_path = dir.path().join("LCK.NasFileCopy");
        let adapter = Arc::new(SimulatedAdapter::demo(&root));
        Self {
            _dir: dir,
            root,
            lock_path,
            adapter,
            engine,
        }
    }

    fn context(&self) -> AppContext {
        let config = AppConfig {
            mount_root: self.root.clone(),
            lock_path: self.lock_path.clone(),
            unmount_retry_secs: 0,
            simulation: true,
            ..Default::default()
        };
        AppContext::new(config, self.adapter.clone(), Arc::new(self.engine.clone()))
    }

    async fn copy(&self, source: &str, label: &str) -> CopyOutcome {
        let request = CopyRequest {
            source_name: Some(source.to_string()),
            destination_label: Some(label.to_string()),
            force_kill: false,
        };
        Orchestrator::new(self.context()).run(&request, CancellationToken::new()).await.unwrap()
    }
}

fn spawn_sleeper() -> Child {
    Command::new("sleep")
        .arg("30")
        .stdout(Stdio::null())
        .spawn()
        .unwrap()
}

#[tokio::test]
async fn copies_dataset_onto_labelled_drive() {
    let host = Host::new();
    let outcome = host.copy("myFiles", "BACKUP1").await;

    assert_eq!(outcome.code, ExitCode::Ok);
    assert!(outcome.acceptable.is_none());

    let target = host.root.join("BACKUP1");
    assert_eq!(
        host.adapter.mount_calls(),
        vec![("BACKUP1".to_string(), target.clone())]
    );
    assert_eq!(
        host.engine.requests(),
        vec![TransferRequest {
            source: host.root.join("myFiles"),
            destination: target.clone(),
        }]
    );
    assert_eq!(host.adapter.unmount_calls(), vec![target]);
    assert!(!host.lock_path.exists());
}

#[tokio::test]
async fn unknown_source_lists_alternatives() {
    let host = Host::new();
    let outcome = host.copy("otherFiles", "BACKUP1").await;

    assert_eq!(outcome.code, ExitCode::BadSourceDataSet);
    let acceptable = outcome.acceptable.unwrap();
    assert_eq!(acceptable.acceptable_source_names, vec!["myFiles".to_string()]);
    assert!(host.adapter.mount_calls().is_empty());
    assert!(host.engine.requests().is_empty());
    assert!(!host.lock_path.exists());
}

#[tokio::test]
async fn unknown_label_lists_alternatives() {
    let host = Host::new();
    let outcome = host.copy("myFiles", "NOPE").await;

    assert_eq!(outcome.code, ExitCode::BadDestinationLabel);
    let acceptable = outcome.acceptable.unwrap();
    assert_eq!(
        acceptable.acceptable_destination_labels,
        vec!["system".to_string(), "BACKUP1".to_string()]
    );
    assert!(host.adapter.mount_calls().is_empty());
    assert!(!host.lock_path.exists());
}

#[tokio::test]
async fn live_lock_owner_blocks_copy() {
    let host = Host::new();
    let mut sleeper = spawn_sleeper();
    std::fs::write(&host.lock_path, format!("{{\"pid\": {}}}", sleeper.id())).unwrap();

    let outcome = host.copy("myFiles", "BACKUP1").await;

    assert_eq!(outcome.code, ExitCode::ProcessAlreadyRunning);
    assert!(host.lock_path.exists());
    assert!(host.engine.requests().is_empty());

    sleeper.kill().unwrap();
    sleeper.wait().unwrap();
}

#[tokio::test]
async fn force_kill_takes_over_the_lock() {
    let host = Host::new();
    let mut sleeper = spawn_sleeper();
    std::fs::write(&host.lock_path, format!("{{\"pid\": {}}}", sleeper.id())).unwrap();

    let request = CopyRequest {
        source_name: Some("myFiles".to_string()),
        destination_label: Some("BACKUP1".to_string()),
        force_kill: true,
    };
    let outcome = Orchestrator::new(host.context()).run(&request, CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.code, ExitCode::Ok);
    assert!(sleeper.wait().unwrap().code().is_none());
    assert!(!host.lock_path.exists());
}

#[tokio::test]
async fn label_is_sanitized_for_the_mount_point() {
    let host = Host::new();
    host.adapter.add_partition("/dev/sdc", "/dev/sdc1", "B@CKUP 1");

    let outcome = host.copy("myFiles", "B@CKUP 1").await;

    assert_eq!(outcome.code, ExitCode::Ok);
    let target = host.root.join("B64CKUP321");
    assert_eq!(
        host.adapter.mount_calls(),
        vec![("B@CKUP 1".to_string(), target.clone())]
    );
    assert_eq!(host.engine.requests()[0].destination, target);
}

#[tokio::test]
async fn mounted_destination_is_reused() {
    let host = Host::new();
    let existing = host.root.join("existing");
    std::fs::create_dir(&existing).unwrap();
    host.adapter
        .mark_mounted("/dev/sdb1", &existing.to_string_lossy());

    let outcome = host.copy("myFiles", "BACKUP1").await;

    assert_eq!(outcome.code, ExitCode::Ok);
    assert!(host.adapter.mount_calls().is_empty());
    assert_eq!(host.engine.requests()[0].destination, existing);
    assert_eq!(host.adapter.unmount_calls(), vec![existing]);
}

#[tokio::test]
async fn failed_sync_still_unmounts_and_unlocks() {
    let host = Host::with_engine(SimulatedEngine::failing(23));
    let outcome = host.copy("myFiles", "BACKUP1").await;

    assert_eq!(outcome.code, ExitCode::SyncFailure);
    assert_eq!(host.adapter.unmount_calls(), vec![host.root.join("BACKUP1")]);
    assert!(!host.lock_path.exists());
}

#[tokio::test]
async fn unsafe_label_fails_to_mount() {
    let host = Host::new();
    host.adapter.add_partition("/dev/sdc", "/dev/sdc1", "BACK'UP");

    let outcome = host.copy("myFiles", "BACK'UP").await;

    assert_eq!(outcome.code, ExitCode::MountFailure);
    assert!(host.adapter.mount_calls().is_empty());
    assert!(host.engine.requests().is_empty());
    assert!(!host.lock_path.exists());
}

#[tokio::test]
async fn missing_arguments_are_rejected() {
    let host = Host::new();
    let request = CopyRequest {
        source_name: Some("myFiles".to_string()),
        ..Default::default()
    };
    let outcome = Orchestrator::new(host.context()).run(&request, CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.code, ExitCode::ArgumentOrCliIssue);
    assert!(!host.lock_path.exists());
}

#[tokio::test]
async fn interrupted_sync_unmounts_before_releasing_the_lock() {
    let host = Host::with_engine(SimulatedEngine::default().with_delay(Duration::from_secs(30)));
    let request = CopyRequest {
        source_name: Some("myFiles".to_string()),
        destination_label: Some("BACKUP1".to_string()),
        force_kill: false,
    };
    let cancel = CancellationToken::new();
    let mut orchestrator = Orchestrator::new(host.context());

    let interrupt = async {
        while host.engine.requests().is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
        assert!(host.lock_path.exists());
        assert!(host.adapter.unmount_calls().is_empty());
        cancel.cancel();
    };
    let (outcome, ()) = tokio::time::timeout(
        Duration::from_secs(5),
        async { tokio::join!(orchestrator.run(&request, cancel.clone()), interrupt) },
    )
    .await
    .unwrap();

    let outcome = outcome.unwrap();
    assert_eq!(outcome.code, ExitCode::UncaughtException);
    assert_eq!(host.adapter.unmount_calls(), vec![host.root.join("BACKUP1")]);
    assert!(!host.lock_path.exists());
}

#[tokio::test]
async fn interruption_before_the_lock_leaves_nothing_behind() {
    let host = Host::new();
    let request = CopyRequest {
        source_name: Some("myFiles".to_string()),
        destination_label: Some("BACKUP1".to_string()),
        force_kill: false,
    };
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = Orchestrator::new(host.context())
        .run(&request, cancel)
        .await
        .unwrap();

    assert_eq!(outcome.code, ExitCode::UncaughtException);
    assert!(host.adapter.mount_calls().is_empty());
    assert!(host.engine.requests().is_empty());
    assert!(!host.lock_path.exists());
}
