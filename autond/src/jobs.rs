//  JOBS.rs
//    by Lut99
//
//  Created:
//    18 Nov 2024, 14:44:23
//  Last edited:
//    05 Mar 2025, 16:31:54
//  Auto updated?
//    Yes
//
//  Description:
//!   Defines the handlers for the two control-API functions on the `/job`
//!   path: `run` submits a Job to an endpoint, `status` polls it (and
//!   reclaims it on a terminal read).
//

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use auton_plg::spec::{Job, JobRequest, JobSnapshot, JobStatus, RunPayload};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::{debug, info};
use serde::Serialize;
use serde_json::Value;
use warp::http::HeaderMap;
use warp::hyper::body::Bytes;
use warp::{reject, Rejection, Reply};

use crate::errors::RequestError;
use crate::spec::Context;


/***** CONSTANTS *****/
/// The most entries any payload list may carry.
const MAX_LIST_ENTRIES: usize = 64;
/// The longest accepted environment variable name.
const MAX_ENV_KEY_LEN: usize = 64;





/***** HELPER FUNCTIONS *****/
/// Whether the given string is an acceptable environment variable name
/// (`[a-zA-Z_][a-zA-Z0-9_]{0,63}`).
fn valid_env_key(key: &str) -> bool {
    if key.is_empty() || key.len() > MAX_ENV_KEY_LEN {
        return false;
    }
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {},
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validates the query against the fixed `{endpoint, id}` schema.
///
/// # Errors
/// This function errors if either key is missing or extra keys are present.
fn validate_query(params: &HashMap<String, String>) -> Result<(String, String), RequestError> {
    let endpoint: &String = params.get("endpoint").ok_or(RequestError::InvalidArguments)?;
    let id: &String = params.get("id").ok_or(RequestError::InvalidArguments)?;
    if params.len() != 2 {
        return Err(RequestError::InvalidArguments);
    }
    Ok((endpoint.clone(), id.clone()))
}

/// Validates a list-of-strings payload field.
fn validate_string_list(value: &Value) -> Result<(), RequestError> {
    let list: &Vec<Value> = value.as_array().ok_or(RequestError::InvalidArguments)?;
    if list.len() > MAX_LIST_ENTRIES || !list.iter().all(Value::is_string) {
        return Err(RequestError::InvalidArguments);
    }
    Ok(())
}

/// Validates the body against the fixed `{env?, envfiles?, args?, argfiles?}` schema.
///
/// # Returns
/// The typed payload plus the raw body for plugins that forward it.
///
/// # Errors
/// This function errors with [`RequestError::InvalidArgumentsType`] when the body is not a
/// JSON object at all, and [`RequestError::InvalidArguments`] on any schema violation.
fn validate_payload(body: &Bytes) -> Result<(RunPayload, Option<String>), RequestError> {
    if body.is_empty() {
        return Ok((RunPayload::default(), None));
    }
    let text: String = String::from_utf8(body.to_vec()).map_err(|_| RequestError::InvalidArgumentsType)?;
    let value: Value = serde_json::from_str(&text).map_err(|_| RequestError::InvalidArgumentsType)?;
    let map = value.as_object().ok_or(RequestError::InvalidArgumentsType)?;

    for (key, value) in map {
        match key.as_str() {
            "args" | "envfiles" => validate_string_list(value)?,

            "env" => {
                let env = value.as_object().ok_or(RequestError::InvalidArguments)?;
                if env.len() > MAX_LIST_ENTRIES {
                    return Err(RequestError::InvalidArguments);
                }
                for (key, value) in env {
                    if !valid_env_key(key) || !value.is_string() {
                        return Err(RequestError::InvalidArguments);
                    }
                }
            },

            "argfiles" => {
                let list = value.as_array().ok_or(RequestError::InvalidArguments)?;
                if list.len() > MAX_LIST_ENTRIES {
                    return Err(RequestError::InvalidArguments);
                }
                for entry in list {
                    let entry = entry.as_object().ok_or(RequestError::InvalidArguments)?;
                    for field in ["arg", "content", "filename"] {
                        if !entry.get(field).map(Value::is_string).unwrap_or(false) {
                            return Err(RequestError::InvalidArguments);
                        }
                    }
                }
            },

            _ => return Err(RequestError::InvalidArguments),
        }
    }

    let payload: RunPayload = serde_json::from_value(value).map_err(|_| RequestError::InvalidArguments)?;
    Ok((payload, Some(text)))
}

/// Collects the inbound headers into the Job's snapshot map (keys are lowercase by
/// construction in warp's [`HeaderMap`]).
fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers.iter().map(|(key, value)| (key.as_str().into(), String::from_utf8_lossy(value.as_bytes()).into_owned())).collect()
}

/// Builds the server-side variables of the request snapshot: the caller's address and the
/// Basic-auth username as `HTTP_AUTH_USER`.
fn server_vars(headers: &HeaderMap, addr: Option<SocketAddr>) -> HashMap<String, String> {
    let mut vars: HashMap<String, String> = HashMap::new();
    if let Some(addr) = addr {
        vars.insert("REMOTE_ADDR".into(), addr.ip().to_string());
    }
    if let Some(encoded) = headers.get("authorization").and_then(|value| value.to_str().ok()).and_then(|value| value.strip_prefix("Basic ")) {
        if let Ok(decoded) = STANDARD.decode(encoded.trim()) {
            if let Some((user, _)) = String::from_utf8_lossy(&decoded).split_once(':') {
                vars.insert("HTTP_AUTH_USER".into(), user.into());
            }
        }
    }
    vars
}





/***** AUXILLARY *****/
/// The body of every successful control response: a snapshot of the Job.
///
/// `code` is 400 as soon as the Job has errors, even though the HTTP status stays 200: the
/// request succeeded, the job did not.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    /// 200, or 400 when the Job has errors.
    pub code: u16,
    /// The Job's uid.
    pub uid: String,
    /// The Job's status.
    pub status: JobStatus,
    /// The Job's return code, if terminal.
    pub return_code: Option<i32>,
    /// When the worker picked the Job up.
    pub started_at: Option<f64>,
    /// When the Job terminated.
    pub ended_at: Option<f64>,
    /// The result lines appended since the previous poll.
    pub stream: Vec<String>,
    /// All error lines, present iff there are any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}
impl JobResponse {
    /// Builds the response from a Job snapshot.
    fn new(uid: impl Into<String>, snapshot: JobSnapshot) -> Self {
        let has_error: bool = !snapshot.errors.is_empty();
        Self {
            code: if has_error { 400 } else { 200 },
            uid: uid.into(),
            status: snapshot.status,
            return_code: snapshot.return_code,
            started_at: snapshot.started_at,
            ended_at: snapshot.ended_at,
            stream: snapshot.stream,
            errors: if has_error { Some(snapshot.errors) } else { None },
        }
    }
}





/***** LIBRARY *****/
/// Handles `POST /job/run?endpoint=<name>&id=<id>`: validates, registers and enqueues a new
/// Job, then answers with its initial snapshot.
///
/// # Errors
/// Rejects with 400/415 on shape/schema errors, 404 on an unknown endpoint, 415 on a uid
/// collision and 503 when the registry lock cannot be taken in time.
pub async fn run(
    params: HashMap<String, String>,
    headers: HeaderMap,
    addr: Option<SocketAddr>,
    body: Bytes,
    context: Arc<Context>,
) -> Result<impl Reply, Rejection> {
    let (endpoint_name, id): (String, String) = validate_query(&params).map_err(reject::custom)?;
    let (payload, body): (RunPayload, Option<String>) = validate_payload(&body).map_err(reject::custom)?;
    debug!("run request for endpoint '{endpoint_name}', id '{id}'");

    // The endpoint must exist before anything is created
    let endpoint = match context.endpoints.get(&endpoint_name) {
        Some(endpoint) => endpoint,
        None => return Err(reject::custom(RequestError::UnknownEndpoint { endpoint: endpoint_name })),
    };

    // Snapshot the request into the Job
    let request: JobRequest = JobRequest {
        method: "post".into(),
        path: "/job/run".into(),
        headers: header_map(&headers),
        params: params.clone(),
        payload,
        body,
        server_vars: server_vars(&headers, addr),
    };
    let uid: String = format!("{endpoint_name}:{id}");
    let job: Arc<Job> = Arc::new(Job::new(endpoint_name, uid.clone(), "run", request, endpoint.vars.clone()));

    // Register first (uid uniqueness lives here), then hand it to the worker
    context.registry.insert(job.clone()).await.map_err(|err| reject::custom(RequestError::from(err)))?;
    if let Err(err) = endpoint.queue.qput(job.clone()) {
        // Back the insert out again so the uid is not wedged
        let _ = context.registry.discard(&uid).await;
        info!("refused job '{uid}': {err}");
        return Err(reject::custom(RequestError::QueueClosed { endpoint: job.endpoint.clone() }));
    }
    info!("job accepted: '{uid}'");

    Ok(warp::reply::json(&JobResponse::new(uid, job.poll_snapshot())))
}



/// Handles `GET /job/status?endpoint=<name>&id=<id>`: answers with the Job's snapshot
/// (incremental `stream`) and takes the Job out of the registry on a terminal read.
///
/// # Errors
/// Rejects with 400/415 on shape/schema errors, 404 on an unknown uid and 503 when the
/// registry lock cannot be taken in time.
pub async fn status(params: HashMap<String, String>, context: Arc<Context>) -> Result<impl Reply, Rejection> {
    let (endpoint_name, id): (String, String) = validate_query(&params).map_err(reject::custom)?;
    let uid: String = format!("{endpoint_name}:{id}");
    debug!("status request for '{uid}'");

    let job: Arc<Job> = match context.registry.get(&uid).await.map_err(|err| reject::custom(RequestError::from(err)))? {
        Some(job) => job,
        None => return Err(reject::custom(RequestError::UnknownUid { uid })),
    };

    // The snapshot advances the stream cursor; a terminal observation reclaims the Job
    let snapshot: JobSnapshot = job.poll_snapshot();
    if snapshot.status == JobStatus::Complete {
        context.registry.take_terminal(&uid).await.map_err(|err| reject::custom(RequestError::from(err)))?;
        info!("job reclaimed after terminal poll: '{uid}'");
    }

    Ok(warp::reply::json(&JobResponse::new(uid, snapshot)))
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use super::*;


    #[test]
    fn test_valid_env_key() {
        assert!(valid_env_key("PATH"));
        assert!(valid_env_key("_private"));
        assert!(valid_env_key("KEY_2"));
        assert!(valid_env_key(&"a".repeat(64)));

        assert!(!valid_env_key(""));
        assert!(!valid_env_key("2FAST"));
        assert!(!valid_env_key("WITH-DASH"));
        assert!(!valid_env_key(&"a".repeat(65)));
    }

    #[test]
    fn test_validate_query() {
        let mut params: HashMap<String, String> = HashMap::new();
        assert!(validate_query(&params).is_err());

        params.insert("endpoint".into(), "echo".into());
        params.insert("id".into(), "a1".into());
        assert_eq!(validate_query(&params).unwrap(), ("echo".into(), "a1".into()));

        params.insert("extra".into(), "nope".into());
        assert!(validate_query(&params).is_err());
    }

    #[test]
    fn test_validate_payload() {
        // Empty body is fine
        assert!(validate_payload(&Bytes::new()).unwrap().1.is_none());

        // A proper payload
        let (payload, raw) = validate_payload(&Bytes::from(r#"{"args": ["hello"], "env": {"FOO": "bar"}}"#)).unwrap();
        assert_eq!(payload.args, vec!["hello".to_string()]);
        assert_eq!(payload.env.get("FOO").map(String::as_str), Some("bar"));
        assert!(raw.is_some());

        // Shape errors are 400s
        assert!(matches!(validate_payload(&Bytes::from("not json")), Err(RequestError::InvalidArgumentsType)));
        assert!(matches!(validate_payload(&Bytes::from("[1,2]")), Err(RequestError::InvalidArgumentsType)));

        // Schema violations are 415s
        assert!(matches!(validate_payload(&Bytes::from(r#"{"bogus": 1}"#)), Err(RequestError::InvalidArguments)));
        assert!(matches!(validate_payload(&Bytes::from(r#"{"env": {"2FAST": "x"}}"#)), Err(RequestError::InvalidArguments)));
        assert!(matches!(validate_payload(&Bytes::from(r#"{"args": "hello"}"#)), Err(RequestError::InvalidArguments)));
        assert!(matches!(validate_payload(&Bytes::from(r#"{"argfiles": [{"arg": "-f"}]}"#)), Err(RequestError::InvalidArguments)));

        // The bound on list lengths
        let too_many: String = format!("{{\"args\": [{}]}}", vec!["\"x\""; 65].join(","));
        assert!(matches!(validate_payload(&Bytes::from(too_many)), Err(RequestError::InvalidArguments)));
    }

    #[test]
    fn test_server_vars_basic_auth() {
        let mut headers: HeaderMap = HeaderMap::new();
        // "alice:secret"
        headers.insert("authorization", "Basic YWxpY2U6c2VjcmV0".parse().unwrap());
        let vars = server_vars(&headers, Some("127.0.0.1:9999".parse().unwrap()));
        assert_eq!(vars.get("HTTP_AUTH_USER").map(String::as_str), Some("alice"));
        assert_eq!(vars.get("REMOTE_ADDR").map(String::as_str), Some("127.0.0.1"));
    }
}
