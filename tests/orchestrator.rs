mod common;

use common::{builder, Counting, Detaching, RecordingManager};
use nix::sys::signal::Signal;
use sandboxd::error::{GracefulError, OrchestratorError, RegistryError};
use sandboxd::graceful::{GracefulHooks, INHERIT_ENV};
use sandboxd::orchestrator::MASTER_ENV;
use sandboxd::{Config, ProcessModel, SandboxState, SetupOutcome};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn duplicate_sandbox_is_rejected_without_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = builder(dir.path(), &[]).build();

    let first = Counting::new("s1");
    orchestrator.add_sandbox(first.clone(), None).unwrap();
    let err = orchestrator.add_sandbox(Counting::new("s1"), None).unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateSandbox { .. }));

    let services = orchestrator.services();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].name(), "default");
    assert_eq!(services[0].len(), 1);

    // Same name in another service is fine.
    orchestrator.add_sandbox(Counting::new("s1"), Some("other")).unwrap();
    assert_eq!(orchestrator.services().len(), 2);

    assert!(matches!(
        orchestrator.add_sandbox(Counting::new("a,b"), Some("third")),
        Err(RegistryError::InvalidName(_))
    ));
    assert!(orchestrator.service("third").is_none());
}

#[tokio::test]
async fn single_model_starts_only_filtered_sandboxes() {
    let dir = tempfile::tempdir().unwrap();
    let manager = RecordingManager::new();
    let orchestrator = builder(dir.path(), &["s2"])
        .process_manager(manager.clone())
        .build();
    let sandboxes = [Counting::new("s1"), Counting::new("s2"), Counting::new("s3")];

    let outcome = orchestrator
        .setup(|o| {
            for sandbox in &sandboxes {
                o.add_sandbox(sandbox.clone(), None)?;
            }
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(outcome, SetupOutcome::Running);

    let service = orchestrator.service("default").unwrap();
    assert_eq!(service.container("s1").unwrap().state(), SandboxState::Unknown);
    assert_eq!(service.container("s2").unwrap().state(), SandboxState::Running);
    assert_eq!(service.container("s3").unwrap().state(), SandboxState::Unknown);
    assert!(service.container("s2").unwrap().status().started_at.is_some());

    assert_eq!(orchestrator.pid_file().read().unwrap(), std::process::id());
    assert!(manager.calls().is_empty());
}

#[tokio::test]
async fn multi_master_skips_services_without_sandboxes() {
    let dir = tempfile::tempdir().unwrap();
    let manager = RecordingManager::new();
    let orchestrator = builder(dir.path(), &[])
        .process_model(ProcessModel::Multi)
        .process_manager(manager.clone())
        .worker_command("/usr/bin/true")
        .shutdown_timeout(Duration::from_secs(9))
        .build();

    orchestrator
        .setup(|o| {
            o.add_sandbox(Counting::new("s1"), Some("A"))?;
            o.add_sandbox(Counting::new("tmp"), Some("B"))?;
            o.service("B").unwrap().remove_sandbox("tmp");
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(manager.calls(), vec!["new:A", "start:A"]);
    let created = manager.created();
    assert_eq!(created.len(), 1);
    let worker = &created[0];
    assert_eq!(worker.command, std::path::PathBuf::from("/usr/bin/true"));
    assert_eq!(worker.args, vec!["start", "s1"]);
    assert!(worker
        .env
        .contains(&(MASTER_ENV.to_string(), "false".to_string())));
    assert!(worker.auto_restart);
    assert_eq!(worker.stop_signals, vec![Signal::SIGQUIT, Signal::SIGTERM]);
    assert_eq!(worker.stop_wait, Duration::from_secs(3));
    assert!(worker.extra_files.is_empty());

    // The master supervises; it does not run sandboxes itself.
    let container = orchestrator.find_sandbox("s1").unwrap().1;
    assert_eq!(container.state(), SandboxState::Unknown);
    assert!(orchestrator.pid_file().exists());
}

#[tokio::test]
async fn multi_master_passes_filtered_names() {
    let dir = tempfile::tempdir().unwrap();
    let manager = RecordingManager::new();
    let orchestrator = builder(dir.path(), &["s2"])
        .process_model(ProcessModel::Multi)
        .process_manager(manager.clone())
        .worker_command("/usr/bin/true")
        .build();

    orchestrator
        .setup(|o| {
            for name in ["s1", "s2", "s3"] {
                o.add_sandbox(Counting::new(name), Some("A"))?;
            }
            o.add_sandbox(Counting::new("t1"), Some("B"))?;
            Ok(())
        })
        .await
        .unwrap();

    let created = manager.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].name, "A");
    assert_eq!(created[0].args, vec!["start", "s2"]);
}

#[tokio::test]
async fn worker_args_carry_the_configured_environment() {
    let dir = tempfile::tempdir().unwrap();
    let manager = RecordingManager::new();
    let orchestrator = builder(dir.path(), &[])
        .process_model(ProcessModel::Multi)
        .process_manager(manager.clone())
        .worker_command("/usr/bin/true")
        .config(Config::from_value(json!({"ENV_NAME": "staging"})))
        .build();

    orchestrator
        .setup(|o| {
            o.add_sandbox(Counting::new("s1"), Some("A"))?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(manager.created()[0].args, vec!["start", "s1", "--env=staging"]);
}

#[tokio::test]
async fn worker_runs_its_sandboxes_without_pid_file() {
    let dir = tempfile::tempdir().unwrap();
    let manager = RecordingManager::new();
    let orchestrator = builder(dir.path(), &["s1"])
        .master(false)
        .process_manager(manager.clone())
        .build();
    let s1 = Counting::new("s1");

    orchestrator
        .setup(|o| {
            o.add_sandbox(s1.clone(), Some("A"))?;
            o.add_sandbox(Counting::new("s2"), Some("A"))?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(orchestrator.model(), ProcessModel::Multi);
    let service = orchestrator.service("A").unwrap();
    assert_eq!(service.container("s1").unwrap().state(), SandboxState::Running);
    assert!(service.container("s2").is_none());
    assert!(!orchestrator.pid_file().exists());
    assert!(manager.calls().is_empty());
}

#[tokio::test]
async fn first_sweep_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let hook_calls = Arc::new(AtomicUsize::new(0));
    let counter = hook_calls.clone();
    let orchestrator = builder(dir.path(), &[])
        .before_stop(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        })
        .build();
    orchestrator.setup(|_| Ok(())).await.unwrap();
    assert!(orchestrator.pid_file().exists());

    assert!(orchestrator.first_sweep().await.unwrap());
    assert!(!orchestrator.pid_file().exists());

    // A pid file appearing afterwards proves the second sweep did nothing.
    orchestrator.pid_file().write().unwrap();
    assert!(!orchestrator.first_sweep().await.unwrap());
    assert!(orchestrator.pid_file().exists());
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    assert!(orchestrator.is_shutting_down());
}

#[tokio::test]
async fn worker_sweep_leaves_the_master_pid_file() {
    let dir = tempfile::tempdir().unwrap();
    let worker = builder(dir.path(), &[]).master(false).build();
    worker.setup(|_| Ok(())).await.unwrap();

    // Same path as the master's pid file.
    worker.pid_file().write_pid(4242).unwrap();
    assert!(worker.first_sweep().await.unwrap());
    assert_eq!(worker.pid_file().read().unwrap(), 4242);
}

#[tokio::test]
async fn vetoed_sweep_releases_the_latch() {
    let dir = tempfile::tempdir().unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let orchestrator = builder(dir.path(), &[])
        .before_stop(move |_| counter.fetch_add(1, Ordering::SeqCst) > 0)
        .build();
    orchestrator.setup(|_| Ok(())).await.unwrap();

    assert!(matches!(
        orchestrator.first_sweep().await,
        Err(GracefulError::Vetoed)
    ));
    assert!(!orchestrator.is_shutting_down());
    assert!(orchestrator.pid_file().exists());

    assert!(orchestrator.first_sweep().await.unwrap());
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn before_exiting_shuts_down_every_sandbox() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = builder(dir.path(), &[]).build();
    let web = Counting::new("web");
    let failing = Counting::new("failing");
    failing.fail_shutdown.store(true, Ordering::SeqCst);
    let cron = Counting::new("cron");

    orchestrator
        .setup(|o| {
            o.add_sandbox(web.clone(), Some("api"))?;
            o.add_sandbox(failing.clone(), Some("api"))?;
            o.add_sandbox(cron.clone(), Some("jobs"))?;
            Ok(())
        })
        .await
        .unwrap();

    orchestrator.before_exiting().await;
    for sandbox in [&web, &failing, &cron] {
        assert_eq!(sandbox.shutdowns(), 1);
    }
    for service in orchestrator.services() {
        for container in service.containers() {
            assert_eq!(container.state(), SandboxState::Stopped);
        }
    }
}

#[tokio::test]
async fn multi_master_stops_workers_on_exit() {
    let dir = tempfile::tempdir().unwrap();
    let manager = RecordingManager::new();
    let orchestrator = builder(dir.path(), &[])
        .process_model(ProcessModel::Multi)
        .process_manager(manager.clone())
        .worker_command("/usr/bin/true")
        .build();
    orchestrator
        .setup(|o| {
            o.add_sandbox(Counting::new("s1"), Some("A"))?;
            Ok(())
        })
        .await
        .unwrap();

    orchestrator.before_exiting().await;
    assert!(manager.calls().contains(&"stop:A".to_string()));
}

#[tokio::test]
async fn reload_without_inheritance_is_stop_then_start() {
    let dir = tempfile::tempdir().unwrap();
    let manager = RecordingManager::new();
    let orchestrator = builder(dir.path(), &[])
        .process_model(ProcessModel::Multi)
        .process_manager(manager.clone())
        .worker_command("/usr/bin/true")
        .build();
    orchestrator
        .setup(|o| {
            o.add_sandbox(Counting::new("s1"), Some("A"))?;
            Ok(())
        })
        .await
        .unwrap();

    manager.calls.lock().unwrap().clear();
    GracefulHooks::reload(&*orchestrator).await;
    assert_eq!(manager.calls(), vec!["stop:A", "start:A"]);
}

#[tokio::test]
async fn reload_with_inheritance_replaces_first() {
    let dir = tempfile::tempdir().unwrap();
    let manager = RecordingManager::new();
    let orchestrator = builder(dir.path(), &[])
        .process_model(ProcessModel::Multi)
        .process_manager(manager.clone())
        .worker_command("/usr/bin/true")
        .inherit_addr("127.0.0.1:0")
        .build();
    orchestrator
        .setup(|o| {
            o.add_sandbox(Counting::new("s1"), Some("A"))?;
            Ok(())
        })
        .await
        .unwrap();

    let worker = &manager.created()[0];
    assert_eq!(worker.extra_files.len(), 1);
    assert!(worker
        .env
        .contains(&(INHERIT_ENV.to_string(), "127.0.0.1:0".to_string())));

    manager.calls.lock().unwrap().clear();
    GracefulHooks::reload(&*orchestrator).await;
    assert_eq!(manager.calls(), vec!["reload:A"]);
}

#[tokio::test]
async fn single_model_ignores_reload() {
    let dir = tempfile::tempdir().unwrap();
    let manager = RecordingManager::new();
    let orchestrator = builder(dir.path(), &[])
        .process_manager(manager.clone())
        .build();
    let s1 = Counting::new("s1");
    orchestrator
        .setup(|o| {
            o.add_sandbox(s1.clone(), None)?;
            Ok(())
        })
        .await
        .unwrap();

    GracefulHooks::reload(&*orchestrator).await;
    assert!(manager.calls().is_empty());
    assert_eq!(s1.shutdowns(), 0);
}

#[tokio::test]
async fn shutdown_event_drives_the_exit_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = builder(dir.path(), &[]).build();
    let s1 = Counting::new("s1");
    orchestrator
        .setup(|o| {
            o.add_sandbox(s1.clone(), None)?;
            Ok(())
        })
        .await
        .unwrap();

    orchestrator.shutdown();
    orchestrator.wait().await.unwrap();
    assert_eq!(s1.shutdowns(), 1);
    assert!(!orchestrator.pid_file().exists());
}

#[tokio::test(start_paused = true)]
async fn exit_sequence_is_bounded_by_the_budget() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = builder(dir.path(), &[])
        .shutdown_timeout(Duration::from_secs(15))
        .build();
    let stuck = Counting::new("stuck");
    stuck.hang_shutdown.store(true, Ordering::SeqCst);
    orchestrator
        .setup(|o| {
            o.add_sandbox(stuck.clone(), None)?;
            Ok(())
        })
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    orchestrator.shutdown();
    orchestrator.wait().await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(15));
    assert_eq!(stuck.shutdowns(), 1);
}

#[tokio::test]
async fn setup_runs_once() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = builder(dir.path(), &[]).build();
    orchestrator.setup(|_| Ok(())).await.unwrap();
    assert!(matches!(
        orchestrator.setup(|_| Ok(())).await,
        Err(OrchestratorError::AlreadySetup)
    ));
}

#[tokio::test]
async fn start_callback_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = builder(dir.path(), &[]).build();
    let result = orchestrator
        .setup(|_| Err(anyhow::anyhow!("no database")))
        .await;
    assert!(matches!(result, Err(OrchestratorError::Start(_))));
    assert!(!orchestrator.pid_file().exists());
}

#[tokio::test]
async fn daemon_flag_detaches_before_registration() {
    let dir = tempfile::tempdir().unwrap();
    let daemonizer = Arc::new(Detaching::default());
    let orchestrator = builder(dir.path(), &[])
        .daemonizer(daemonizer.clone())
        .config(Config::from_value(json!({"Daemon": true})))
        .build();
    let registered = Arc::new(AtomicUsize::new(0));
    let counter = registered.clone();

    let outcome = orchestrator
        .setup(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(outcome, SetupOutcome::Detached);
    assert_eq!(daemonizer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(registered.load(Ordering::SeqCst), 0);
    assert!(!orchestrator.pid_file().exists());
}

#[tokio::test]
async fn stubborn_worker_is_killed_within_the_budget() {
    use sandboxd::ProcessManager;
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("stubborn-worker");
    std::fs::write(
        &script,
        "#!/bin/sh\ntrap '' QUIT TERM\nwhile true; do sleep 0.1; done\n",
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let orchestrator = builder(dir.path(), &[])
        .process_model(ProcessModel::Multi)
        .process_manager(Arc::new(sandboxd::LocalProcessManager::new()))
        .worker_command(&script)
        .shutdown_timeout(Duration::from_secs(3))
        .build();
    orchestrator
        .setup(|o| {
            o.add_sandbox(Counting::new("s1"), Some("A"))?;
            Ok(())
        })
        .await
        .unwrap();

    let pid = orchestrator
        .process_manager()
        .process_info("A")
        .await
        .unwrap()
        .pid
        .unwrap();
    // Let the shell install its traps.
    tokio::time::sleep(Duration::from_millis(300)).await;

    orchestrator.shutdown();
    orchestrator.wait().await.unwrap();

    let gone = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None);
    assert_eq!(gone, Err(nix::errno::Errno::ESRCH));
}
