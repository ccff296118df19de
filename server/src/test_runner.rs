#![cfg(test)]

//! This module runs test cases defined in `server/test/cases`.
//!
//! Each test case consists of two files, named in terms of `<name>`, the name of the test case:
//! * `<name>.http`: the request. The first line is the method and path, followed by headers, one
//!   per line, then an empty line and the body, if any.
//! * `<name>.json`: the expected response, as an object with a `status`, optional `headers`, and
//!   an optional `body`.
//!
//! This runner will start a server over the papers in `server/test/data`, with a scripted language
//! model, and scan the cases directory for all such pairs of files, sending each request and
//! making sure that the response matches the expected response. Expected headers and body are
//! compared as a subset of the actual response: objects may have extra keys, but arrays must
//! match element by element.

use super::api::{self, State};
use ansi_term::Color;
use anyhow::Error;
use async_std::task::{sleep, spawn};
use futures::future::join_all;
use model::{
    catalog::Catalog,
    grading::{model::Scripted, Grader},
    init_logging,
    stats::Stats,
};
use portpicker::pick_unused_port;
use serde_json::{json, Value};
use std::ffi::OsString;
use std::fmt::{self, Display, Formatter};
use std::fs::{self, File};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use surf::{
    http::{Method, StatusCode},
    Client,
};
use tempfile::TempDir;

/// What the scripted model says about every submission.
const REPORT: &str = "## 总评\n\n**得分**：15／满分20\n\n要点基本齐全，但表述不够精炼。\n";

#[async_std::test]
async fn http_api_test_cases() -> Result<(), Error> {
    init_logging();

    // Discover test cases.
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    let test_cases = manifest
        .join("test/cases")
        .read_dir()?
        .filter_map(|dirent| {
            let path = dirent.unwrap().path();
            if path.extension()?.to_str().unwrap() == "http" {
                Some(TestCase::new(&path).unwrap())
            } else {
                None
            }
        })
        .collect::<Vec<_>>();
    assert!(!test_cases.is_empty(), "no test cases found");

    let tmp = TempDir::new()?;
    let client = start_server(&tmp).await?;

    let results = join_all(test_cases.into_iter().map(|test| test.run(client.clone()))).await;
    for result in &results {
        println!("{}", result);
    }
    if results.iter().any(TestResult::failed) {
        Err(Error::msg(format!("{}", Color::Red.paint("tests failed"))))
    } else {
        println!("All test cases passed.");
        Ok(())
    }
}

#[async_std::test]
async fn list_not_modified() -> Result<(), Error> {
    init_logging();
    let tmp = TempDir::new()?;
    let client = start_server(&tmp).await?;

    let res = client.get("/api/list").await.map_err(Error::msg)?;
    assert_eq!(res.status(), StatusCode::Ok);
    let etag = res.header("ETag").unwrap().last().as_str().to_string();
    assert!(etag.starts_with('"') && etag.ends_with('"'), "{etag}");

    let mut res = client
        .get("/api/list")
        .header("If-None-Match", etag.as_str())
        .await
        .map_err(Error::msg)?;
    assert_eq!(res.status(), StatusCode::NotModified);
    assert_eq!(res.header("ETag").unwrap().last().as_str(), etag);
    assert_eq!(
        res.header("Cache-Control").unwrap().last().as_str(),
        "public, max-age=3600, stale-while-revalidate=86400"
    );
    assert_eq!(res.body_string().await.map_err(Error::msg)?, "");

    // A stale tag gets the full index.
    let res = client
        .get("/api/list")
        .header("If-None-Match", "\"stale\"")
        .await
        .map_err(Error::msg)?;
    assert_eq!(res.status(), StatusCode::Ok);
    Ok(())
}

#[async_std::test]
async fn submission_statistics() -> Result<(), Error> {
    init_logging();
    let tmp = TempDir::new()?;
    let client = start_server(&tmp).await?;

    let submissions = [
        ("203.0.113.7", json!({"paperId": "gwy_jiangsu_2024_A", "answers": {"q1": "作答"}})),
        ("203.0.113.7", json!({"paperId": "gwy_jiangsu_2024_A", "answers": {"q3": "作文"}})),
        ("198.51.100.2", json!({"paperId": "gk_2023", "answers": {"q1": "作答"}})),
        // Rejected submissions are not counted.
        ("198.51.100.3", json!({"paperId": "gk_2023"})),
    ];
    for (ip, body) in submissions {
        client
            .post("/api/grade")
            .header("X-Forwarded-For", ip)
            .body_json(&body)
            .map_err(Error::msg)?
            .await
            .map_err(Error::msg)?;
    }

    let summary: Value = client
        .get("/api/stats/submit")
        .recv_json()
        .await
        .map_err(Error::msg)?;
    assert_eq!(summary["total_small"], 2);
    assert_eq!(summary["total_essay"], 1);
    assert_eq!(summary["by_date"].as_array().unwrap().len(), 1);
    assert_eq!(summary["by_date"][0]["users"], 2);
    assert_eq!(summary["by_date"][0]["small"], 2);
    assert_eq!(summary["by_date"][0]["essay"], 1);

    // Without a database, statistics are mirrored to JSON.
    assert!(tmp.path().join("submit_stats.json").is_file());
    Ok(())
}

/// Start a server over the test papers, with statistics kept in `tmp`.
async fn start_server(tmp: &TempDir) -> Result<Client, Error> {
    let data = Path::new(env!("CARGO_MANIFEST_DIR")).join("test/data");
    let state = State::new(
        Catalog::load(data)?,
        Grader::new(Scripted::reply(REPORT)),
        Stats::open(None, &tmp.path().join("submit_stats.json")),
    );
    let port = pick_unused_port().unwrap();
    spawn(async move {
        api::serve(state, port).await.unwrap();
        tracing::warn!("server exited");
    });

    // Connect a client.
    let client: Client = surf::Config::default()
        .set_base_url(format!("http://localhost:{port}").parse().unwrap())
        .try_into()
        .unwrap();
    // Wait for the server to come up.
    wait_for_server(&client).await?;
    Ok(client)
}

#[derive(Clone, Debug)]
struct TestCase {
    name: OsString,
    request: Request,
    response: Value,
}

#[derive(Clone, Debug)]
struct Request {
    method: Method,
    path: String,
    headers: Vec<(String, String)>,
    body: Option<String>,
}

impl Request {
    fn parse(text: &str) -> Result<Self, Error> {
        let (head, body) = match text.split_once("\n\n") {
            Some((head, body)) => (head, Some(body.trim().to_string())),
            None => (text, None),
        };
        let mut lines = head.lines();
        let (method, path) = lines
            .next()
            .and_then(|line| line.trim().split_once(' '))
            .ok_or_else(|| Error::msg("request is missing `METHOD PATH` line"))?;
        let headers = lines
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let (name, value) = line
                    .split_once(':')
                    .ok_or_else(|| Error::msg(format!("malformed header {line}")))?;
                Ok((name.trim().to_string(), value.trim().to_string()))
            })
            .collect::<Result<_, Error>>()?;
        Ok(Self {
            method: Method::from_str(method).map_err(Error::msg)?,
            path: path.trim().into(),
            headers,
            body: body.filter(|body| !body.is_empty()),
        })
    }
}

impl TestCase {
    fn new(request_path: impl AsRef<Path>) -> Result<Self, Error> {
        let request_path = request_path.as_ref();
        let name = request_path.file_stem().unwrap();
        let request = Request::parse(&fs::read_to_string(request_path)?)?;
        let response_path = request_path.with_extension("json");
        let response = serde_json::from_reader(File::open(response_path)?)?;
        Ok(Self {
            name: name.into(),
            request,
            response,
        })
    }

    async fn run(self, client: Client) -> TestResult {
        TestResult {
            name: self.name,
            failure: Self::do_test(client, self.request, self.response)
                .await
                .err(),
        }
    }

    async fn do_test(client: Client, request: Request, expected: Value) -> Result<(), Error> {
        let mut req = client.request(request.method, &request.path);
        if let Some(body) = request.body {
            req = req.body_string(body);
        }
        for (name, value) in &request.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let mut res = req.await.map_err(Error::msg)?;

        let status = res.status();
        if expected["status"] != u16::from(status) {
            let body = res.body_string().await.unwrap_or_default();
            return Err(Error::msg(format!(
                "expected status {}, got {status}: {body}",
                expected["status"]
            )));
        }

        for (name, value) in expected["headers"].as_object().into_iter().flatten() {
            let actual = res.header(name.as_str()).map(|h| h.last().as_str().to_string());
            if actual.as_deref() != value.as_str() {
                return Err(Error::msg(format!(
                    "expected header {name}: {value}, got {actual:?}"
                )));
            }
        }

        if let Some(expected_body) = expected.get("body") {
            let body: Value = res
                .body_json()
                .await
                .map_err(|err| Error::msg(format!("cannot parse response body as JSON: {err}")))?;
            if !matches(expected_body, &body) {
                return Err(Error::msg(format!(
                    "expected response:\n{expected_body}\nactual response:\n{body}"
                )));
            }
        }
        Ok(())
    }
}

struct TestResult {
    name: OsString,
    failure: Option<anyhow::Error>,
}

impl TestResult {
    fn failed(&self) -> bool {
        self.failure.is_some()
    }
}

impl Display for TestResult {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}...", self.name.to_string_lossy())?;
        if let Some(err) = &self.failure {
            writeln!(f, "{}", Color::Red.paint("FAILED"))?;
            write!(f, "{err}")?;
        } else {
            write!(f, "{}", Color::Green.paint("OK"))?;
        }
        Ok(())
    }
}

async fn wait_for_server(client: &Client) -> Result<(), Error> {
    const MAX_CONNECT_RETRIES: usize = 60;

    for _ in 0..MAX_CONNECT_RETRIES {
        match client.get("/api/list").await {
            Ok(_) => return Ok(()),
            Err(err) => {
                tracing::warn!("waiting for server to start: {err}");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }

    Err(Error::msg("timed out waiting for server"))
}

/// Is `expected` a subset of `actual`?
fn matches(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Object(expected), Value::Object(actual)) => expected
            .iter()
            .all(|(key, val)| actual.get(key).is_some_and(|actual| matches(val, actual))),
        (Value::Array(expected), Value::Array(actual)) => {
            expected.len() == actual.len()
                && expected.iter().zip(actual).all(|(e, a)| matches(e, a))
        }
        _ => expected == actual,
    }
}

#[test]
fn test_matches() {
    let actual = json!({"a": 1, "b": [{"c": 2, "d": 3}], "e": "f"});
    assert!(matches(&json!({}), &actual));
    assert!(matches(&json!({"b": [{"c": 2}]}), &actual));
    assert!(!matches(&json!({"b": []}), &actual));
    assert!(!matches(&json!({"a": 2}), &actual));
    assert!(!matches(&json!({"z": null}), &actual));
}

#[test]
fn test_parse_request() {
    let req = Request::parse("POST /api/grade\nContent-Type: application/json\n\n{\"a\": 1}\n")
        .unwrap();
    assert_eq!(req.method, Method::Post);
    assert_eq!(req.path, "/api/grade");
    assert_eq!(
        req.headers,
        [("Content-Type".to_string(), "application/json".to_string())]
    );
    assert_eq!(req.body.as_deref(), Some("{\"a\": 1}"));

    let req = Request::parse("GET /api/list\n").unwrap();
    assert_eq!(req.method, Method::Get);
    assert!(req.headers.is_empty());
    assert_eq!(req.body, None);
}
