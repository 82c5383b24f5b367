//  HTTP.rs
//    by Lut99
//
//  Created:
//    14 Nov 2024, 14:03:28
//  Last edited:
//    05 Mar 2025, 11:40:19
//  Auto updated?
//    Yes
//
//  Description:
//!   Implements the `http` plugin, which forwards an inbound Job request
//!   as an outbound HTTP call: URL surgery, header/param composition over
//!   the inbound request and the response body as the Job result.
//

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use auton_cfg::credentials::Credentials;
use log::debug;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use url::Url;

use crate::compose::{self, ComposeEntry, FormatArgs, FormatValue, RegexOp, RegexOpSpec};
use crate::errors::{EndpointError, TargetError};
use crate::spec::{AutonTarget, Job, Plugin, DEFAULT_TARGET_TIMEOUT};


/***** CONSTANTS *****/
/// The HTTP methods a target may use for its outbound call.
pub const ALLOWED_METHODS: [&str; 6] = ["delete", "get", "head", "patch", "post", "put"];





/***** HELPER FUNCTIONS *****/
/// Parses a lowercase method name into a [`Method`], if it's one we allow.
fn parse_method(raw: &str) -> Option<Method> {
    match raw {
        "delete" => Some(Method::DELETE),
        "get" => Some(Method::GET),
        "head" => Some(Method::HEAD),
        "patch" => Some(Method::PATCH),
        "post" => Some(Method::POST),
        "put" => Some(Method::PUT),
        _ => None,
    }
}





/***** AUXILLARY *****/
/// How the outbound path may be written down: a literal, or a regex spec applied to the
/// inbound path.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum PathSpec {
    /// A regex operation over the inbound path.
    Regex(RegexOpSpec),
    /// Use this path verbatim.
    Literal(String),
}

/// The compiled form of a [`PathSpec`].
#[derive(Clone, Debug)]
enum PathRule {
    Literal(String),
    Rewrite(RegexOp),
}

/// The target configuration of an `http` endpoint.
#[derive(Clone, Debug, Deserialize)]
pub struct HttpConfig {
    /// The base URL of the target.
    pub url: String,

    /// Overrides the inbound request's method. Must be one of [`ALLOWED_METHODS`].
    #[serde(default)]
    pub method:  Option<String>,
    /// Overrides the outbound path.
    #[serde(default)]
    pub path:    Option<PathSpec>,
    /// A modifier list merged over the inbound headers.
    #[serde(default)]
    pub headers: Option<serde_yaml::Value>,
    /// A modifier list merged over the inbound query parameters.
    #[serde(default)]
    pub params:  Option<serde_yaml::Value>,
    /// When present and false, the inbound payload is forwarded as the body.
    #[serde(default)]
    pub remove_payload: Option<bool>,
    /// Seconds before the outbound call is abandoned.
    #[serde(default)]
    pub timeout: Option<u64>,
}





/***** LIBRARY *****/
/// The plugin that forwards Jobs as outbound HTTP calls.
pub struct HttpPlugin {
    target: AutonTarget,
    url: Url,
    method: Option<Method>,
    path: Option<PathRule>,
    headers: Vec<ComposeEntry>,
    params: Vec<ComposeEntry>,
    remove_payload: Option<bool>,
    client: Client,
}
impl HttpPlugin {
    /// Builds the plugin for one endpoint from its target config.
    ///
    /// # Arguments
    /// - `name`: The endpoint name.
    /// - `config`: The endpoint's `config` mapping.
    /// - `credentials`: The target's credentials, sent as HTTP Basic auth when given.
    ///
    /// # Errors
    /// This function errors on a missing/invalid `url`, a disallowed `method`, or invalid
    /// modifier lists. Such an endpoint is skipped at startup.
    pub fn new(name: impl Into<String>, config: &serde_yaml::Mapping, credentials: Option<Credentials>) -> Result<Self, EndpointError> {
        let name: String = name.into();
        let cfg: HttpConfig = serde_yaml::from_value(serde_yaml::Value::Mapping(config.clone()))
            .map_err(|err| EndpointError::ConfigDeserialize { endpoint: name.clone(), err })?;

        let url: Url = Url::parse(&cfg.url).map_err(|err| EndpointError::IllegalUrl { endpoint: name.clone(), raw: cfg.url.clone(), err })?;
        let method: Option<Method> = match &cfg.method {
            Some(raw) => {
                let raw: String = raw.to_lowercase();
                Some(parse_method(&raw).ok_or(EndpointError::IllegalMethod { endpoint: name.clone(), raw })?)
            },
            None => None,
        };
        let path: Option<PathRule> = match cfg.path {
            Some(PathSpec::Literal(path)) => Some(PathRule::Literal(path)),
            Some(PathSpec::Regex(spec)) => {
                Some(PathRule::Rewrite(RegexOp::new(spec).map_err(|err| EndpointError::Compose { endpoint: name.clone(), err })?))
            },
            None => None,
        };
        let headers: Vec<ComposeEntry> = match &cfg.headers {
            Some(value) => compose::parse_entries(value).map_err(|err| EndpointError::Compose { endpoint: name.clone(), err })?,
            None => vec![],
        };
        let params: Vec<ComposeEntry> = match &cfg.params {
            Some(value) => compose::parse_entries(value).map_err(|err| EndpointError::Compose { endpoint: name.clone(), err })?,
            None => vec![],
        };

        let client: Client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout.unwrap_or(DEFAULT_TARGET_TIMEOUT)))
            .build()
            .map_err(|err| EndpointError::ClientBuild { endpoint: name.clone(), err })?;

        Ok(Self { target: AutonTarget { name, credentials }, url, method, path, headers, params, remove_payload: cfg.remove_payload, client })
    }

    /// Shorthand for a [`TargetError::Failed`] on this target.
    #[inline]
    fn failed(&self, msg: impl Into<String>, code: Option<i32>) -> TargetError {
        TargetError::Failed { target: self.target.name.clone(), msg: msg.into(), code }
    }

    /// The kwargs `%`-templates in header/param lists are rendered against.
    fn format_args(&self, job: &Job) -> FormatArgs {
        let vars = job.vars();
        let mut args: FormatArgs = HashMap::with_capacity(3 + vars.extra.len());
        args.insert("env".into(), FormatValue::Map(vars.env.clone()));
        args.insert("time".into(), FormatValue::Str(vars.time_str()));
        args.insert("gmtime".into(), FormatValue::Str(vars.gmtime_str()));
        for (key, value) in &vars.extra {
            args.insert(key.clone(), FormatValue::Str(value.clone()));
        }
        args
    }

    /// Forwards one Job as an outbound call and stores the response body as its result.
    async fn deploy_job(&self, job: &Arc<Job>) -> Result<(), TargetError> {
        let request = &job.request;

        // The config override wins over the inbound method; both must be allowed
        let method: Method = match &self.method {
            Some(method) => method.clone(),
            None => parse_method(&request.method).ok_or_else(|| self.failed(format!("invalid http method: '{}'", request.method), None))?,
        };

        // Rebuild the URL: base target, inbound (or rewritten) path, composed query
        let path: String = match &self.path {
            None => request.path.clone(),
            Some(PathRule::Literal(path)) => path.clone(),
            Some(PathRule::Rewrite(op)) => op.apply(&request.path).map_err(|err| self.failed(format!("failed to rewrite path: {err}"), None))?,
        };
        let mut url: Url = self.url.clone();
        url.set_path(&path);
        url.set_query(None);

        // Headers: the inbound set minus content-length, then the config's modifier list
        let fmt: FormatArgs = self.format_args(job);
        let mut headers: HashMap<String, String> =
            request.headers.iter().filter(|(key, _)| key.as_str() != "content-length").map(|(key, value)| (key.clone(), value.clone())).collect();
        compose::compose_dict(&self.headers, "header", &request.headers, &fmt, &mut headers)
            .map_err(|err| self.failed(format!("invalid headers: {err}"), None))?;

        // Query params: the inbound set, then the config's modifier list
        let mut params: HashMap<String, String> = request.params.clone();
        compose::compose_dict(&self.params, "params", &request.params, &fmt, &mut params)
            .map_err(|err| self.failed(format!("invalid params: {err}"), None))?;

        let mut header_map: HeaderMap = HeaderMap::with_capacity(headers.len());
        for (key, value) in &headers {
            let key: HeaderName = HeaderName::from_bytes(key.as_bytes()).map_err(|err| self.failed(format!("invalid header '{key}': {err}"), None))?;
            let value: HeaderValue = HeaderValue::from_str(value).map_err(|err| self.failed(format!("invalid header value: {err}"), None))?;
            header_map.insert(key, value);
        }

        // Off it goes
        let mut req = self.client.request(method, url.clone()).headers(header_map).query(&params.iter().collect::<Vec<_>>());
        if let Some(false) = self.remove_payload {
            if let Some(body) = &request.body {
                req = req.body(body.clone());
            }
        }
        if let Some(creds) = &self.target.credentials {
            req = req.basic_auth(&creds.username, Some(&creds.password));
        }
        let res = req
            .send()
            .await
            .map_err(|err| self.failed(format!("request to '{url}' failed: {err}"), err.status().map(|code| code.as_u16() as i32)))?;

        // Whatever came back is the Job's result
        let status: StatusCode = res.status();
        let text: String = res
            .text()
            .await
            .map_err(|err| self.failed(format!("failed to read response body from '{url}': {err}"), Some(status.as_u16() as i32)))?;
        debug!("target '{}', url '{}', status {}, response payload: {:?}", self.target.name, url, status, text);
        for line in text.lines() {
            job.add_result(line.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for HttpPlugin {
    #[inline]
    fn kind(&self) -> &'static str { "http" }

    #[inline]
    fn target_name(&self) -> &str { &self.target.name }

    // `deploy` is the canonical name; `run` is what the control API submits
    #[inline]
    fn methods(&self) -> &'static [&'static str] { &["run", "deploy"] }

    async fn call(&self, method: &str, job: &Arc<Job>) -> Result<(), TargetError> {
        match method {
            "run" | "deploy" => self.deploy_job(job).await,
            method => Err(TargetError::UnknownMethod { endpoint: self.target.name.clone(), method: method.into() }),
        }
    }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::SocketAddr;

    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    use super::*;
    use crate::spec::JobRequest;


    /// Builds a plugin for the given target config YAML.
    fn plugin(config: &str, credentials: Option<Credentials>) -> Result<HttpPlugin, EndpointError> {
        let config: serde_yaml::Mapping = serde_yaml::from_str(config).unwrap();
        HttpPlugin::new("test", &config, credentials)
    }

    /// Spawns a one-shot upstream that answers every request with the given body and sends the
    /// raw request bytes back over a channel.
    async fn spawn_upstream(body: &'static str) -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let listener: TcpListener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };

                // Read until the end of the request headers
                let mut raw: Vec<u8> = vec![];
                let mut buf: [u8; 4096] = [0; 4096];
                while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => raw.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = tx.send(String::from_utf8_lossy(&raw).into_owned());
                let res: String = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}", body.len(), body);
                let _ = sock.write_all(res.as_bytes()).await;
            }
        });
        (addr, rx)
    }


    #[test]
    fn test_config_validation() {
        assert!(matches!(plugin("method: get\n", None), Err(EndpointError::ConfigDeserialize { .. })));
        assert!(matches!(plugin("url: 'not a url'\n", None), Err(EndpointError::IllegalUrl { .. })));
        assert!(matches!(plugin("url: http://localhost/\nmethod: trace\n", None), Err(EndpointError::IllegalMethod { .. })));
        assert!(plugin("url: http://localhost/\nmethod: GET\n", None).is_ok());
    }

    #[tokio::test]
    async fn test_deploy_stores_response_body() {
        let (addr, mut seen) = spawn_upstream("upstream says hi\nsecond line").await;
        let plug = plugin(&format!("url: 'http://{addr}/'\nmethod: get\npath: /upstream\nheaders:\n- 'x-forwarded-by': auton\n"), None).unwrap();

        let mut request: JobRequest = JobRequest::default();
        request.params.insert("endpoint".into(), "test".into());
        let job = std::sync::Arc::new(Job::new("test", "test:h1", "run", request, HashMap::new()));

        plug.call("run", &job).await.unwrap();
        assert_eq!(job.result(), vec!["upstream says hi".to_string(), "second line".to_string()]);

        let raw: String = seen.recv().await.unwrap();
        assert!(raw.starts_with("GET /upstream?"));
        assert!(raw.contains("endpoint=test"));
        assert!(raw.contains("x-forwarded-by: auton"));
    }

    #[tokio::test]
    async fn test_basic_auth_is_sent() {
        let (addr, mut seen) = spawn_upstream("ok").await;
        let creds = Credentials { username: "alice".into(), password: "secret".into() };
        let plug = plugin(&format!("url: 'http://{addr}/'\nmethod: get\n"), Some(creds)).unwrap();

        let job = std::sync::Arc::new(Job::new("test", "test:h2", "run", JobRequest::default(), HashMap::new()));
        plug.call("deploy", &job).await.unwrap();

        let raw: String = seen.recv().await.unwrap();
        // "alice:secret"
        assert!(raw.contains("authorization: Basic YWxpY2U6c2VjcmV0"));
    }

    #[tokio::test]
    async fn test_unreachable_target_fails() {
        // Bind-then-drop guarantees a closed port
        let closed: SocketAddr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let plug = plugin(&format!("url: 'http://{closed}/'\nmethod: get\n"), None).unwrap();
        let job = std::sync::Arc::new(Job::new("test", "test:h3", "run", JobRequest::default(), HashMap::new()));
        let err = plug.call("run", &job).await.unwrap_err();
        assert!(matches!(err, TargetError::Failed { .. }));
    }

    #[tokio::test]
    async fn test_path_rewrite() {
        let (addr, mut seen) = spawn_upstream("ok").await;
        let plug = plugin(
            &format!("url: 'http://{addr}/'\nmethod: get\npath:\n  pattern: '^/job'\n  repl: '/api'\n"),
            None,
        )
        .unwrap();

        let job = std::sync::Arc::new(Job::new("test", "test:h4", "run", JobRequest::default(), HashMap::new()));
        plug.call("run", &job).await.unwrap();

        let raw: String = seen.recv().await.unwrap();
        assert!(raw.starts_with("GET /api/run"), "got: {raw}");
    }
}
