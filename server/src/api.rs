//! The HTTP API.

use model::{
    catalog::{Catalog, PaperError},
    grading::{GradeError, Grader, Submission},
    stats::Stats,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tide::{
    http::{
        headers::{CACHE_CONTROL, ETAG, IF_NONE_MATCH},
        mime,
    },
    security::{CorsMiddleware, Origin},
    utils::After,
    Body, Request, Response, Server, StatusCode,
};
use tide_compress::CompressMiddleware;

/// The index changes only on deploy, but clients should pick up a deploy within the hour.
const LIST_CACHE_CONTROL: &str = "public, max-age=3600, stale-while-revalidate=86400";
/// A paper never changes once published.
const PAPER_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";
/// Smallest response body worth compressing, in bytes.
const COMPRESS_THRESHOLD: usize = 500;

/// Shared server state.
#[derive(Clone)]
pub struct State {
    catalog: Arc<Catalog>,
    grader: Arc<Grader>,
    stats: Arc<Stats>,
}

impl State {
    pub fn new(catalog: Catalog, grader: Grader, stats: Stats) -> Self {
        Self {
            catalog: Arc::new(catalog),
            grader: Arc::new(grader),
            stats: Arc::new(stats),
        }
    }
}

/// Build the app.
pub fn app(state: State) -> Server<State> {
    let mut app = tide::with_state(state);
    app.with(CorsMiddleware::new().allow_origin(Origin::Any));
    app.with(CompressMiddleware::builder().threshold(COMPRESS_THRESHOLD).build());
    app.with(After(error_detail));
    app.at("/api/list").get(list);
    app.at("/api/paper").get(paper);
    app.at("/api/stats/submit").get(stats);
    app.at("/api/grade").post(grade);
    app
}

/// Serve the app on `port`, on all interfaces.
pub async fn serve(state: State, port: u16) -> tide::Result<()> {
    tracing::info!("listening on port {port}");
    app(state).listen(format!("0.0.0.0:{port}")).await?;
    Ok(())
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

/// Replace the body of error responses with `{"detail": <message>}`.
async fn error_detail(mut res: Response) -> tide::Result {
    if let Some(detail) = res.error().map(|err| err.to_string()) {
        if res.status().is_server_error() {
            tracing::error!(status = %res.status(), "{detail}");
        } else {
            tracing::info!(status = %res.status(), "{detail}");
        }
        res.set_body(Body::from_json(&ErrorBody { detail })?);
    }
    Ok(res)
}

async fn list(req: Request<State>) -> tide::Result {
    let catalog = &req.state().catalog;
    let etag = catalog.etag();
    let fresh = req
        .header(IF_NONE_MATCH)
        .is_some_and(|header| header.last().as_str() == etag);
    let res = Response::builder(if fresh {
        StatusCode::NotModified
    } else {
        StatusCode::Ok
    })
    .header(CACHE_CONTROL, LIST_CACHE_CONTROL)
    .header(ETAG, etag);
    if fresh {
        return Ok(res.build());
    }
    Ok(res
        .body(Body::from_bytes(catalog.index_json().to_vec()))
        .content_type(mime::JSON)
        .build())
}

#[derive(Deserialize)]
struct PaperQuery {
    id: String,
}

async fn paper(req: Request<State>) -> tide::Result {
    let PaperQuery { id } = req.query()?;
    let json = req.state().catalog.paper_json(&id).map_err(|err| {
        let status = match err {
            PaperError::NotFound(_) => StatusCode::NotFound,
            PaperError::Malformed(_) => StatusCode::InternalServerError,
        };
        tide::Error::new(status, err)
    })?;
    Ok(Response::builder(StatusCode::Ok)
        .body(Body::from_bytes(json.into_owned()))
        .content_type(mime::JSON)
        .header(CACHE_CONTROL, PAPER_CACHE_CONTROL)
        .build())
}

async fn stats(req: Request<State>) -> tide::Result {
    Ok(Response::builder(StatusCode::Ok)
        .body(Body::from_json(&req.state().stats.summary())?)
        .build())
}

async fn grade(mut req: Request<State>) -> tide::Result {
    let submission: Submission = req.body_json().await?;
    let ip = client_ip(&req);
    let state = req.state().clone();

    let job = submission.resolve(&state.catalog).map_err(grade_error)?;
    state.stats.record(job.kind(), ip.as_deref());
    let report = state.grader.grade(&job).await.map_err(grade_error)?;
    Ok(Response::builder(StatusCode::Ok)
        .body(Body::from_json(&report)?)
        .build())
}

fn grade_error(err: GradeError) -> tide::Error {
    let status = match &err {
        GradeError::BadRequest(_) => StatusCode::BadRequest,
        GradeError::Unavailable(_) => StatusCode::ServiceUnavailable,
        GradeError::Internal(_) => StatusCode::InternalServerError,
    };
    tide::Error::new(status, err)
}

/// The client's IP: the first `X-Forwarded-For` entry when behind a proxy, else the peer address.
fn client_ip(req: &Request<State>) -> Option<String> {
    if let Some(forwarded) = req.header("X-Forwarded-For") {
        return forwarded_ip(forwarded.last().as_str());
    }
    req.peer_addr().map(host)
}

fn forwarded_ip(header: &str) -> Option<String> {
    let ip = header.split(',').next()?.trim();
    (!ip.is_empty()).then(|| ip.to_string())
}

/// Strip the port from a socket address.
fn host(addr: &str) -> String {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']').into()
}
