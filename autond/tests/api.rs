//  API.rs
//    by Lut99
//
//  Created:
//    19 Nov 2024, 10:24:18
//  Last edited:
//    06 Mar 2025, 09:58:32
//  Auto updated?
//    Yes
//
//  Description:
//!   End-to-end tests for the control API: real endpoints backed by real
//!   subprocesses (and a local upstream for the `http` plugin), driven
//!   through the warp filter tree.
//

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use auton_cfg::daemon::DaemonConfig;
use auton_cfg::info::Info as _;
use autond::server::routes;
use autond::spec::Context;
use serde_json::{json, Value};
use warp::Filter;
use warp::filters::BoxedFilter;
use warp::Reply;


/***** HELPER FUNCTIONS *****/
/// Builds the filter tree for the given daemon config, with all workers spawned.
fn setup(config: &str) -> BoxedFilter<(impl Reply,)> {
    let config: DaemonConfig = DaemonConfig::from_string(config).unwrap();
    let (context, workers) = Context::from_config(&config, None);
    for worker in workers {
        tokio::spawn(worker.run());
    }
    routes(Arc::new(context))
}

/// The standard test config: an echoing endpoint, a failing one and a slow one.
fn standard_config() -> &'static str {
    r#"
general:
  lock_timeout: 2
endpoints:
  echo:
    plugin: subproc
    config:
      prog: /bin/echo
  lines:
    plugin: subproc
    config:
      prog: /bin/sh
      args: ['-c', 'echo one; sleep 0.2; echo two; sleep 0.2; echo three']
  fail:
    plugin: subproc
    config:
      prog: /bin/sh
      args: ['-c', 'exit 7']
  slow:
    plugin: subproc
    config:
      prog: /bin/sleep
      args: ['5']
      timeout: 1
"#
}

/// Submits a run request and returns its parsed body (asserting HTTP 200).
async fn submit<R: Reply + 'static>(filter: &BoxedFilter<(R,)>, endpoint: &str, id: &str, payload: Option<Value>) -> Value {
    let mut req = warp::test::request().method("POST").path(&format!("/job/run?endpoint={endpoint}&id={id}"));
    if let Some(payload) = payload {
        req = req.json(&payload);
    }
    let res = req.reply(filter).await;
    assert_eq!(res.status(), 200, "run failed: {}", String::from_utf8_lossy(res.body()));
    serde_json::from_slice(res.body()).unwrap()
}

/// Polls a Job until it reports `complete`, returning the final body and the concatenation of
/// every `stream` slice seen on the way.
async fn poll_until_complete<R: Reply + 'static>(filter: &BoxedFilter<(R,)>, endpoint: &str, id: &str) -> (Value, Vec<String>) {
    let mut stream: Vec<String> = vec![];
    for _ in 0..200 {
        let res = warp::test::request().method("GET").path(&format!("/job/status?endpoint={endpoint}&id={id}")).reply(filter).await;
        assert_eq!(res.status(), 200, "status failed: {}", String::from_utf8_lossy(res.body()));
        let body: Value = serde_json::from_slice(res.body()).unwrap();
        stream.extend(body["stream"].as_array().unwrap().iter().map(|line| line.as_str().unwrap().to_string()));
        if body["status"] == "complete" {
            return (body, stream);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("job '{endpoint}:{id}' did not complete in time");
}





/***** TESTS *****/
#[tokio::test]
async fn test_echo_end_to_end() {
    let filter = setup(standard_config());

    let body: Value = submit(&filter, "echo", "a1", Some(json!({"args": ["hello"]}))).await;
    assert_eq!(body["code"], 200);
    assert_eq!(body["uid"], "echo:a1");
    assert_eq!(body["status"], "new");
    assert_eq!(body["return_code"], Value::Null);

    let (body, stream) = poll_until_complete(&filter, "echo", "a1").await;
    assert_eq!(body["code"], 200);
    assert_eq!(body["return_code"], 0);
    assert!(body.get("errors").is_none());
    assert!(body["started_at"].as_f64().is_some() && body["ended_at"].as_f64().is_some());
    assert_eq!(stream, vec!["hello".to_string()]);
}

#[tokio::test]
async fn test_stream_slices_cover_result_exactly_once() {
    let filter = setup(standard_config());

    submit(&filter, "lines", "s1", None).await;
    let (_, stream) = poll_until_complete(&filter, "lines", "s1").await;
    assert_eq!(stream, vec!["one".to_string(), "two".to_string(), "three".to_string()]);
}

#[tokio::test]
async fn test_failing_target_reports_code() {
    let filter = setup(standard_config());

    submit(&filter, "fail", "b1", None).await;
    let (body, _) = poll_until_complete(&filter, "fail", "b1").await;
    // The job failed, the request did not: response code 400, HTTP status stays 200
    assert_eq!(body["code"], 400);
    assert_eq!(body["return_code"], 7);
    assert!(!body["errors"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_timeout_terminates_slow_target() {
    let filter = setup(standard_config());

    submit(&filter, "slow", "c1", None).await;
    let start = std::time::Instant::now();
    let (body, _) = poll_until_complete(&filter, "slow", "c1").await;
    assert!(start.elapsed() < Duration::from_secs(4), "took {:?}", start.elapsed());
    assert_eq!(body["return_code"], Value::Null);
    assert!(body["errors"].as_array().unwrap().iter().any(|line| line.as_str().unwrap().contains("timeout on target")));
}

#[tokio::test]
async fn test_duplicate_uid_is_refused() {
    let filter = setup(standard_config());

    submit(&filter, "echo", "dup", None).await;
    let res = warp::test::request().method("POST").path("/job/run?endpoint=echo&id=dup").reply(&filter).await;
    assert_eq!(res.status(), 415);
    let body: Value = serde_json::from_slice(res.body()).unwrap();
    assert!(body["message"].as_str().unwrap().contains("uid already exists"));
}

#[tokio::test]
async fn test_unknown_endpoint_and_uid_are_404() {
    let filter = setup(standard_config());

    let res = warp::test::request().method("POST").path("/job/run?endpoint=nonexistent&id=a1").reply(&filter).await;
    assert_eq!(res.status(), 404);

    let res = warp::test::request().method("GET").path("/job/status?endpoint=echo&id=nonexistent").reply(&filter).await;
    assert_eq!(res.status(), 404);
}

#[tokio::test]
async fn test_terminal_poll_reclaims_job() {
    let filter = setup(standard_config());

    submit(&filter, "echo", "once", None).await;
    poll_until_complete(&filter, "echo", "once").await;

    // The terminal observation above took the Job out of the registry
    let res = warp::test::request().method("GET").path("/job/status?endpoint=echo&id=once").reply(&filter).await;
    assert_eq!(res.status(), 404);

    // And the uid is free again
    let body: Value = submit(&filter, "echo", "once", None).await;
    assert_eq!(body["uid"], "echo:once");
}

#[tokio::test]
async fn test_bad_requests_are_rejected() {
    let filter = setup(standard_config());

    // Missing query keys
    let res = warp::test::request().method("POST").path("/job/run?endpoint=echo").reply(&filter).await;
    assert_eq!(res.status(), 415);

    // A payload that is not an object
    let res = warp::test::request().method("POST").path("/job/run?endpoint=echo&id=x1").body("[1, 2]").reply(&filter).await;
    assert_eq!(res.status(), 400);

    // A payload with an unknown key
    let res = warp::test::request().method("POST").path("/job/run?endpoint=echo&id=x2").json(&json!({"bogus": true})).reply(&filter).await;
    assert_eq!(res.status(), 415);

    // An env key that does not match the name pattern
    let res = warp::test::request().method("POST").path("/job/run?endpoint=echo&id=x3").json(&json!({"env": {"NO-DASHES": "x"}})).reply(&filter).await;
    assert_eq!(res.status(), 415);
}

#[tokio::test]
async fn test_http_proxy_forwards_upstream_body() {
    // A local upstream that answers every request with a fixed body
    let (addr, upstream): (SocketAddr, _) =
        warp::serve(warp::any().map(|| "upstream-body")).bind_ephemeral((std::net::Ipv4Addr::LOCALHOST, 0));
    tokio::spawn(upstream);

    let config: String = format!(
        r#"
general:
  lock_timeout: 2
endpoints:
  http-proxy:
    plugin: http
    config:
      url: 'http://{addr}/'
      method: get
"#
    );
    let filter = setup(&config);

    submit(&filter, "http-proxy", "h1", None).await;
    let (body, stream) = poll_until_complete(&filter, "http-proxy", "h1").await;
    assert_eq!(body["return_code"], 0);
    assert_eq!(stream, vec!["upstream-body".to_string()]);
}

#[tokio::test]
async fn test_health() {
    let filter = setup(standard_config());
    let res = warp::test::request().method("GET").path("/health").reply(&filter).await;
    assert_eq!(res.status(), 200);
    assert_eq!(res.body().as_ref(), b"OK\n");
}
