mod support;

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;

use gridlink::api::router;
use gridlink::client::ApiClient;
use gridlink::job::{JobEvent, JobHandle, LifecycleState, KILLED_EXIT_STATUS};
use gridlink::submit::SubmitRequest;
use gridlink::{Bridge, GridError};

use support::{fast_config, stderr, stdout, FakeProbe, ScriptedRunner};

struct TestApp {
    bridge: Arc<Bridge>,
    events_rx: mpsc::UnboundedReceiver<JobEvent>,
    probe: Arc<FakeProbe>,
    runner: Arc<ScriptedRunner>,
    _dir: tempfile::TempDir,
}

impl TestApp {
    async fn new(runner: Arc<ScriptedRunner>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let probe = FakeProbe::new(true);
        let (bridge, events_rx) = Bridge::new(
            fast_config(dir.path()),
            probe.clone(),
            runner.clone(),
            Vec::new(),
        )
        .await
        .unwrap();
        Self {
            bridge,
            events_rx,
            probe,
            runner,
            _dir: dir,
        }
    }

    fn app(&self) -> Router {
        router(self.bridge.clone())
    }

    /// Move translated events into the tracker, as the bridge's recorder does.
    async fn drain_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.bridge.record_event(event).await;
        }
    }
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::String(
            String::from_utf8_lossy(&body).into_owned(),
        ))
    };
    (status, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_reflects_liveness() {
    let test = TestApp::new(ScriptedRunner::new(vec![])).await;

    let (status, body) = send(test.app(), get("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["master_alive"], false);
    assert_eq!(body["accepting_notifications"], false);

    test.bridge.monitor.probe().await;
    let (_, body) = send(test.app(), get("/api/health")).await;
    assert_eq!(body["master_alive"], true);
    assert_eq!(body["accepting_notifications"], true);
    assert_eq!(body["tracked_jobs"], 0);
}

#[tokio::test]
async fn test_events_refused_while_master_down() {
    let test = TestApp::new(ScriptedRunner::new(vec![])).await;
    let notification = json!({"type": "task_state_change", "job_id": 42, "timestamp": 0, "state": 0x80});

    let (status, body) = send(test.app(), post_json("/api/events", notification.clone())).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().starts_with("ERROR:"));

    test.bridge.monitor.probe().await;
    let (status, _) = send(test.app(), post_json("/api/events", notification.clone())).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    // Going down closes the gate again.
    test.probe.set_up(false);
    test.bridge.monitor.probe().await;
    let (status, _) = send(test.app(), post_json("/api/events", notification)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_malformed_event_is_bad_request() {
    let test = TestApp::new(ScriptedRunner::new(vec![])).await;
    test.bridge.monitor.probe().await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/events")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _) = send(test.app(), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_pushed_events_drive_job_status() {
    let mut test = TestApp::new(ScriptedRunner::new(vec![])).await;
    test.bridge.monitor.probe().await;

    let running = json!({"type": "task_state_change", "job_id": 42, "task_id": 3, "timestamp": 1_700_000_000_000i64, "state": 0x80});
    let (status, _) = send(test.app(), post_json("/api/events", running)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    test.drain_events().await;

    let (status, body) = send(test.app(), get("/api/jobs/42.3")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "running");

    // Task 1 is below the running task 3, so it already completed.
    let (_, body) = send(test.app(), get("/api/jobs/42.1")).await;
    assert_eq!(body["state"], "finished");

    let (_, body) = send(test.app(), get("/api/jobs/9999")).await;
    assert_eq!(body["state"], "not_found");

    let (status, _) = send(test.app(), get("/api/jobs/not-a-job")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_deleted_job_is_recorded_as_killed() {
    let mut test = TestApp::new(ScriptedRunner::new(vec![])).await;
    test.bridge.monitor.probe().await;

    let deleted = json!({"type": "job_deleted", "job_id": 77, "timestamp": 1_700_000_500_000i64});
    send(test.app(), post_json("/api/events", deleted)).await;
    test.drain_events().await;

    let record = test
        .bridge
        .store
        .get(&JobHandle::new(77))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.exit_status, KILLED_EXIT_STATUS);

    let (status, body) = send(test.app(), get("/api/jobs/77/finished")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["exit_status"], KILLED_EXIT_STATUS);
}

#[tokio::test]
async fn test_finished_missing_is_not_found() {
    let test = TestApp::new(ScriptedRunner::new(vec![])).await;
    let (status, body) = send(test.app(), get("/api/jobs/123/finished")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("123"));
}

#[tokio::test]
async fn test_submit_and_list_jobs() {
    let test = TestApp::new(ScriptedRunner::new(vec![stdout(
        "Your job 4711 (\"pl_align\") has been submitted",
    )]))
    .await;
    test.bridge.monitor.probe().await;

    let request = json!({
        "executable": "/opt/pipeline/bin/align",
        "args": ["subject01.nii"],
        "user": "alice",
        "name": "pl_align",
    });
    let (status, body) = send(test.app(), post_json("/api/jobs", request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["job_id"], "4711");

    let (_, body) = send(test.app(), get("/api/jobs")).await;
    let jobs = body.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["job_id"], "4711");
    assert_eq!(jobs[0]["state"], "queued");

    let (_, body) = send(test.app(), get("/api/jobs?filter=GridJobNamePrefix%3Dother_")).await;
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_submit_invalid_request() {
    let test = TestApp::new(ScriptedRunner::new(vec![])).await;
    test.bridge.monitor.probe().await;

    let (status, body) = send(test.app(), post_json("/api/jobs", json!({"executable": "/bin/true"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().starts_with("ERROR:"));
    assert_eq!(test.runner.call_count(), 0);
}

#[tokio::test]
async fn test_kill_job() {
    let test = TestApp::new(ScriptedRunner::new(vec![
        stdout("alice has deleted job 4711"),
        stderr(1, "denied: not allowed"),
    ]))
    .await;

    let request = Request::builder()
        .method("DELETE")
        .uri("/api/jobs/4711?user=alice&force=true")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(test.app(), request).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(
        test.runner.calls()[0],
        vec!["sudo", "-u", "alice", "qdel", "-f", "4711"]
    );

    let request = Request::builder()
        .method("DELETE")
        .uri("/api/jobs/4712")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(test.app(), request).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_preferences_switch_retrieval_method() {
    let test = TestApp::new(ScriptedRunner::new(vec![])).await;

    let (status, body) = send(
        test.app(),
        post_json("/api/preferences", json!({"GridFinishedJobRetrievalMethod": "qacct"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert!(body["error"].as_str().unwrap().contains("qacct"));

    let (status, _) = send(
        test.app(),
        post_json("/api/preferences", json!({"GridJobFilter": "GridJobNamePrefix=pl_"})),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_client_talks_to_running_server() {
    let test = TestApp::new(ScriptedRunner::new(vec![
        stdout("Your job 4711 (\"pl_align\") has been submitted"),
        stdout("alice has deleted job 4711"),
    ]))
    .await;
    test.bridge.monitor.probe().await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = test.app();
    let server = tokio::spawn(async move { axum::serve(listener, app).await });
    let client = ApiClient::new(&format!("http://{}/", addr));

    let job_id = client
        .submit(&SubmitRequest {
            executable: Some("/opt/pipeline/bin/align".to_string()),
            args: Some(vec![]),
            user: Some("alice".to_string()),
            name: Some("pl_align".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(job_id, "4711");

    // The server's tracker knows the job, so status is not an accounting guess.
    let handle = JobHandle::new(4711);
    assert_eq!(client.status(&handle).await.unwrap(), LifecycleState::Queued);
    let jobs = client.list(None).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].name.as_deref(), Some("pl_align"));
    assert!(client.list(Some("GridJobNamePrefix=other_")).await.unwrap().is_empty());
    assert!(client.finished(&handle).await.unwrap().is_none());

    client.kill("4711", Some("alice"), false).await.unwrap();
    assert_eq!(test.runner.calls()[1], vec!["sudo", "-u", "alice", "qdel", "4711"]);

    let err = client.submit(&SubmitRequest::default()).await.unwrap_err();
    assert!(matches!(err, GridError::Api(ref message) if message.starts_with("ERROR:")));

    server.abort();
}
