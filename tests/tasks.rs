mod common;

use apitasks_cli::config::TaskApiConfig;
use apitasks_cli::error::ApiError;
use apitasks_cli::jobs;
use apitasks_cli::tasks::{PollOutcome, TaskClient, TaskStatus};
use common::MockApi;
use serde_json::json;
use std::sync::Mutex;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

fn client(api: &MockApi) -> TaskClient {
    TaskClient::from_config(&TaskApiConfig {
        base_url: api.uri(),
        api_key: Some("test-key".into()),
        poll_interval_ms: 10,
        ..Default::default()
    })
    .unwrap()
}

fn submitted(task_id: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "code": 200,
        "data": [ { "status": "submitted", "task_id": task_id } ]
    }))
}

fn task_state(status: &str, progress: u32) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "code": 200,
        "data": { "id": "task_01", "status": status, "progress": progress }
    }))
}

fn completed(url: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "code": 200,
        "data": {
            "id": "task_01",
            "status": "completed",
            "progress": 100,
            "result": { "images": [ { "url": [url], "expires_at": 1765000000 } ] }
        }
    }))
}

#[test]
fn submit_returns_task_id() {
    let api = MockApi::start();
    api.mount(
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .and(header("Authorization", "Bearer test-key"))
            .and(body_partial_json(json!({
                "model": "gemini-3-pro-image-preview",
                "prompt": "a bamboo path",
                "size": "1:1",
                "n": 1,
                "resolution": "1K"
            })))
            .respond_with(submitted("task_01")),
    );

    let submission = client(&api).submit("a bamboo path").unwrap();
    assert_eq!(submission.task_id, "task_01");
}

#[test]
fn submit_fails_cleanly_on_non_2xx() {
    let api = MockApi::start();
    api.mount(
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid token")),
    );

    match client(&api).submit("x") {
        Err(ApiError::Status { status, body }) => {
            assert_eq!(status.as_u16(), 401);
            assert_eq!(body, "invalid token");
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[test]
fn submit_without_task_id_is_malformed() {
    let api = MockApi::start();
    api.mount(
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] }))),
    );

    assert!(matches!(client(&api).submit("x"), Err(ApiError::Malformed(_))));
}

#[test]
fn poll_returns_url_once_completed() {
    let api = MockApi::start();
    api.mount(
        Mock::given(method("GET"))
            .and(path("/v1/tasks/task_01"))
            .and(query_param("language", "zh"))
            .respond_with(task_state("processing", 40))
            .up_to_n_times(2),
    );
    api.mount(
        Mock::given(method("GET"))
            .and(path("/v1/tasks/task_01"))
            .respond_with(completed("https://cdn.example/1.png")),
    );

    let mut seen = Vec::new();
    let outcome = client(&api)
        .poll("task_01", |task, _| seen.push((task.status, task.progress())))
        .unwrap();

    assert_eq!(outcome.url(), Some("https://cdn.example/1.png"));
    assert_eq!(
        seen,
        vec![
            (TaskStatus::Running, 40),
            (TaskStatus::Running, 40),
            (TaskStatus::Completed, 100)
        ]
    );
}

#[test]
fn poll_returns_nothing_on_failure() {
    let api = MockApi::start();
    api.mount(
        Mock::given(method("GET"))
            .and(path("/v1/tasks/task_01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "status": "failed", "progress": 0, "error": { "message": "unsafe prompt" } }
            }))),
    );

    let outcome = client(&api).poll("task_01", |_, _| {}).unwrap();
    assert_eq!(outcome.url(), None);
    assert_eq!(
        outcome,
        PollOutcome::Failed {
            reason: Some("unsafe prompt".into())
        }
    );
}

#[test]
fn poll_stops_when_data_is_missing() {
    let api = MockApi::start();
    api.mount(
        Mock::given(method("GET"))
            .and(path("/v1/tasks/task_01"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({ "error": { "message": "task not found" } })),
            ),
    );

    let err = client(&api).poll("task_01", |_, _| {}).unwrap_err();
    assert!(matches!(err, ApiError::Malformed(_)));
    assert_eq!(api.request_count(), 1);
}

#[test]
fn completed_task_without_an_image_is_malformed() {
    for data in [
        json!({ "status": "completed", "progress": 100, "result": { "images": [] } }),
        json!({ "status": "completed", "progress": 100 }),
    ] {
        let api = MockApi::start();
        api.mount(
            Mock::given(method("GET"))
                .and(path("/v1/tasks/task_01"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "code": 200, "data": data }))),
        );

        let err = client(&api).poll("task_01", |_, _| {}).unwrap_err();
        assert!(matches!(err, ApiError::Malformed(_)), "{err:?}");
        assert_eq!(api.request_count(), 1);
    }
}

#[test]
fn poll_gives_up_after_the_deadline() {
    let api = MockApi::start();
    api.mount(
        Mock::given(method("GET"))
            .and(path("/v1/tasks/task_01"))
            .respond_with(task_state("running", 10)),
    );

    let client = TaskClient::from_config(&TaskApiConfig {
        base_url: api.uri(),
        api_key: Some("test-key".into()),
        poll_interval_ms: 50,
        poll_timeout_secs: 1,
        ..Default::default()
    })
    .unwrap();
    let err = client.poll("task_01", |_, _| {}).unwrap_err();
    assert!(matches!(err, ApiError::Timeout { seconds: 1, .. }));
}

#[test]
fn image_job_reports_each_prompt() {
    let api = MockApi::start();
    api.mount(
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .and(body_partial_json(json!({ "prompt": "good prompt" })))
            .respond_with(submitted("task_01")),
    );
    api.mount(
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .and(body_partial_json(json!({ "prompt": "bad prompt" })))
            .respond_with(ResponseTemplate::new(400).set_body_string("rejected")),
    );
    api.mount(
        Mock::given(method("GET"))
            .and(path("/v1/tasks/task_01"))
            .respond_with(completed("https://cdn.example/ok.png")),
    );

    let events = Mutex::new(Vec::new());
    let report = jobs::generate_images(
        &client(&api),
        vec!["good prompt".into(), "bad prompt".into()],
        |event| {
            if let jobs::TaskEvent::Polled { task_id, .. } = event {
                events.lock().unwrap().push(task_id.to_string());
            }
        },
        |_| {},
    );

    let s = report.summary;
    assert_eq!((s.total, s.succeeded, s.failed, s.skipped), (2, 1, 1, 0));
    assert_eq!(report.successes[0].url, "https://cdn.example/ok.png");
    assert_eq!(report.successes[0].prompt, "good prompt");
    assert_eq!(events.into_inner().unwrap(), vec!["task_01".to_string()]);
}
