//! End-to-end tests: a live supervisor on a private socket prefix,
//! driven through the control protocol like any client.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::net::UnixStream;

use jobd::ipc::{self, ControlServer};
use jobd::protocol::verbs;
use jobd::supervisor::{Supervisor, SupervisorConfig};
use jobd::wire::Value;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

struct TestDaemon {
    client: UnixStream,
    run_handle: tokio::task::JoinHandle<std::io::Result<()>>,
    dir: PathBuf,
}

fn unique_dir() -> PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = PathBuf::from(format!("/tmp/jobd-it-{}-{}", std::process::id(), id));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

async fn start_daemon() -> TestDaemon {
    let dir = unique_dir();
    let prefix = dir.join("run");

    let supervisor = Supervisor::new(SupervisorConfig {
        socket_prefix: prefix.to_string_lossy().into_owned(),
        create_session: true,
        system: false,
    });

    let server = ControlServer::bind(prefix.to_str().unwrap(), true).unwrap();
    let sock = server.socket_path().to_path_buf();

    tokio::spawn(server.serve(supervisor.ipc_sender()));
    let run_handle = tokio::spawn(supervisor.run());

    let client = UnixStream::connect(&sock).await.unwrap();
    TestDaemon {
        client,
        run_handle,
        dir,
    }
}

impl TestDaemon {
    async fn request(&self, msg: Value) -> Value {
        ipc::request(&self.client, &msg).await.unwrap()
    }

    fn cleanup(&self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn dict(entries: Vec<(&str, Value)>) -> Value {
    Value::Dict(
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    )
}

fn verb(name: &str, arg: Value) -> Value {
    dict(vec![(name, arg)])
}

/// Job whose child proves it ran by touching a marker file.
fn marker_job(label: &str, marker: &Path, extra: Vec<(&str, Value)>) -> Value {
    let script = format!("touch {}; exec sleep 60", marker.display());
    let mut entries = vec![
        ("label", Value::string(label)),
        (
            "program-arguments",
            Value::Array(vec![
                Value::string("/bin/sh"),
                Value::string("-c"),
                Value::string(script),
            ]),
        ),
    ];
    entries.extend(extra);
    dict(entries)
}

async fn wait_for(path: &Path) -> bool {
    for _ in 0..200 {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn test_submit_query_and_duplicate() {
    let d = start_daemon().await;

    let job = dict(vec![
        ("label", Value::string("x")),
        ("program", Value::string("/bin/sh")),
    ]);
    let resp = d.request(verb(verbs::SUBMIT_JOB, job.clone())).await;
    assert_eq!(resp.as_errno(), Some(0));

    // Second identical submit: EEXIST, first record untouched.
    let resp = d.request(verb(verbs::SUBMIT_JOB, job)).await;
    assert_eq!(resp.as_errno(), Some(libc::EEXIST));

    let resp = d.request(verb(verbs::GET_JOB, Value::string("x"))).await;
    assert_eq!(resp.get("program").and_then(Value::as_str), Some("/bin/sh"));
    // The loader materializes the on-demand default.
    assert_eq!(resp.get("on-demand").and_then(Value::as_bool), Some(true));

    let resp = d.request(Value::string(verbs::GET_JOBS)).await;
    assert!(resp.get("x").is_some());

    d.cleanup();
}

#[tokio::test]
async fn test_missing_program_is_invalid() {
    let d = start_daemon().await;
    let resp = d
        .request(verb(
            verbs::SUBMIT_JOB,
            dict(vec![("label", Value::string("nothing"))]),
        ))
        .await;
    assert_eq!(resp.as_errno(), Some(libc::EINVAL));

    let resp = d
        .request(verb(verbs::GET_JOB, Value::string("nothing")))
        .await;
    assert_eq!(resp.as_errno(), Some(libc::ESRCH));
    d.cleanup();
}

#[tokio::test]
async fn test_socket_activation_starts_job_on_connect() {
    let d = start_daemon().await;
    let marker = d.dir.join("activated");
    let sock_path = d.dir.join("echo.sock");

    let mut job = marker_job("echo", &marker, vec![]);
    job.insert(
        "sockets",
        dict(vec![(
            "listener",
            Value::Array(vec![dict(vec![
                ("type", Value::string("stream")),
                ("pathname", Value::string(sock_path.to_str().unwrap())),
                ("passive", Value::Bool(true)),
            ])]),
        )]),
    );

    let resp = d.request(verb(verbs::SUBMIT_JOB, job)).await;
    assert_eq!(resp.as_errno(), Some(0));

    // On-demand: nothing runs until a client shows up.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!marker.exists());

    let _conn = UnixStream::connect(&sock_path).await.unwrap();
    assert!(wait_for(&marker).await, "activation never started the job");

    let resp = d.request(verb(verbs::REMOVE_JOB, Value::string("echo"))).await;
    assert_eq!(resp.as_errno(), Some(0));
    d.cleanup();
}

#[tokio::test]
async fn test_forced_start_and_remove_while_running() {
    let d = start_daemon().await;
    let marker = d.dir.join("forced");

    let job = marker_job("forced", &marker, vec![("on-demand", Value::Bool(true))]);
    assert_eq!(d.request(verb(verbs::SUBMIT_JOB, job)).await.as_errno(), Some(0));

    assert_eq!(
        d.request(verb(verbs::START_JOB, Value::string("forced")))
            .await
            .as_errno(),
        Some(0)
    );
    assert!(wait_for(&marker).await, "forced start did not run the job");

    // Remove while the child is alive: the record disappears at once.
    assert_eq!(
        d.request(verb(verbs::REMOVE_JOB, Value::string("forced")))
            .await
            .as_errno(),
        Some(0)
    );
    let resp = d
        .request(verb(verbs::GET_JOB, Value::string("forced")))
        .await;
    assert_eq!(resp.as_errno(), Some(libc::ESRCH));

    // Unknown labels keep reporting not-found afterwards.
    let resp = d
        .request(verb(verbs::STOP_JOB, Value::string("forced")))
        .await;
    assert_eq!(resp.as_errno(), Some(libc::ESRCH));
    d.cleanup();
}

#[tokio::test]
async fn test_queue_directory_activates_when_nonempty() {
    let d = start_daemon().await;
    let marker = d.dir.join("queued");
    let qdir = d.dir.join("spool");
    std::fs::create_dir_all(&qdir).unwrap();

    let mut job = marker_job("spooler", &marker, vec![]);
    job.insert(
        "queue-directories",
        Value::Array(vec![Value::string(qdir.to_str().unwrap())]),
    );
    assert_eq!(d.request(verb(verbs::SUBMIT_JOB, job)).await.as_errno(), Some(0));

    // Empty spool: watching, not running.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!marker.exists());

    std::fs::write(qdir.join("work-item"), b"payload").unwrap();
    assert!(wait_for(&marker).await, "queue item did not activate the job");

    d.request(verb(verbs::REMOVE_JOB, Value::string("spooler"))).await;
    d.cleanup();
}

#[tokio::test]
async fn test_run_at_load_starts_immediately() {
    let d = start_daemon().await;
    let marker = d.dir.join("eager");

    let job = marker_job("eager", &marker, vec![("run-at-load", Value::Bool(true))]);
    assert_eq!(d.request(verb(verbs::SUBMIT_JOB, job)).await.as_errno(), Some(0));
    assert!(wait_for(&marker).await, "run-at-load did not start the job");

    d.request(verb(verbs::REMOVE_JOB, Value::string("eager"))).await;
    d.cleanup();
}

#[tokio::test]
async fn test_batch_and_user_env_verbs_over_wire() {
    let d = start_daemon().await;

    assert_eq!(
        d.request(Value::string(verbs::BATCH_QUERY)).await.as_bool(),
        Some(true)
    );
    assert_eq!(
        d.request(verb(verbs::BATCH_CONTROL, Value::Bool(false)))
            .await
            .as_errno(),
        Some(0)
    );
    assert_eq!(
        d.request(Value::string(verbs::BATCH_QUERY)).await.as_bool(),
        Some(false)
    );
    assert_eq!(
        d.request(verb(verbs::BATCH_CONTROL, Value::Bool(true)))
            .await
            .as_errno(),
        Some(0)
    );

    let resp = d
        .request(verb(
            verbs::SET_USER_ENV,
            dict(vec![("JOBD_IT_VAR", Value::string("yes"))]),
        ))
        .await;
    assert_eq!(resp.as_errno(), Some(0));
    let resp = d.request(Value::string(verbs::GET_USER_ENV)).await;
    assert_eq!(resp.get("JOBD_IT_VAR").and_then(Value::as_str), Some("yes"));
    d.request(verb(verbs::UNSET_USER_ENV, Value::string("JOBD_IT_VAR")))
        .await;

    d.cleanup();
}

#[tokio::test]
async fn test_unknown_verb_and_malformed_message() {
    let d = start_daemon().await;
    assert_eq!(
        d.request(Value::string("does-not-exist")).await.as_errno(),
        Some(libc::ENOSYS)
    );
    assert_eq!(
        d.request(Value::Integer(12)).await.as_errno(),
        Some(libc::EINVAL)
    );
    d.cleanup();
}

#[tokio::test]
async fn test_shutdown_drains_children_then_exits() {
    let d = start_daemon().await;
    let marker = d.dir.join("svc");

    let job = marker_job(
        "svc",
        &marker,
        vec![("on-demand", Value::Bool(false))],
    );
    assert_eq!(d.request(verb(verbs::SUBMIT_JOB, job)).await.as_errno(), Some(0));
    assert!(wait_for(&marker).await, "job did not start");

    let resp = d.request(Value::string(verbs::SHUTDOWN)).await;
    assert_eq!(resp.as_errno(), Some(0));

    // The run loop ends once the signaled child is reaped.
    let TestDaemon {
        client: _client,
        run_handle,
        dir,
    } = d;
    let result = tokio::time::timeout(Duration::from_secs(10), run_handle).await;
    match result {
        Ok(joined) => assert!(joined.unwrap().is_ok()),
        Err(_) => panic!("supervisor did not exit after shutdown"),
    }
    let _ = std::fs::remove_dir_all(&dir);
}
