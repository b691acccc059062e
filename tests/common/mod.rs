#![allow(dead_code)]

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use std::collections::HashMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tile_crawler::BoundingBox;

pub const TILE_SIZE: u32 = 256;
pub const API_KEY: &str = "secret";
pub const SIGN: &str = "abc";

pub fn beijing() -> BoundingBox {
    BoundingBox::new(116.3, 39.8, 116.5, 40.0)
}

/// How long the `slow` route holds each request.
pub const SLOW_RESPONSE: Duration = Duration::from_millis(50);

#[derive(Default)]
pub struct Counters {
    hits: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    arrivals: std::sync::Mutex<Vec<Instant>>,
}

impl Counters {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::SeqCst);
        self.arrivals.lock().unwrap().push(Instant::now());
    }
}

type Shared = Arc<Counters>;

/// An in-process tile server counting every request it receives.
pub struct MockServer {
    pub addr: SocketAddr,
    counters: Shared,
}

impl MockServer {
    pub async fn start() -> Self {
        let counters = Shared::default();
        let app = Router::new()
            .route("/tiles/:z/:x/:y", get(tile))
            .route("/jpeg/:z/:x/:y", get(jpeg_tile))
            .route("/broken/:z/:x/:y", get(broken))
            .route("/html/:z/:x/:y", get(html))
            .route("/empty/:z/:x/:y", get(empty))
            .route("/auth/:z/:x/:y", get(authenticated))
            .route("/slow/:z/:x/:y", get(slow))
            .with_state(counters.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, counters }
    }

    /// A tile URL template for `route`, eg. `tiles` or `broken`.
    pub fn template(&self, route: &str) -> String {
        format!("http://{}/{}/{{z}}/{{x}}/{{y}}", self.addr, route)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path)
    }

    pub fn hits(&self) -> usize {
        self.counters.hits.load(Ordering::SeqCst)
    }

    /// The most requests the server was handling at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.counters.max_in_flight.load(Ordering::SeqCst)
    }

    /// Arrival times of every request, in order.
    pub fn arrivals(&self) -> Vec<Instant> {
        self.counters.arrivals.lock().unwrap().clone()
    }
}

pub fn encode(image: RgbaImage, format: ImageFormat) -> Vec<u8> {
    let image = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(image).to_rgb8()),
        _ => DynamicImage::ImageRgba8(image),
    };

    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, format).unwrap();
    buf.into_inner()
}

pub fn tile_image(x: usize, y: usize) -> RgbaImage {
    RgbaImage::from_pixel(TILE_SIZE, TILE_SIZE, Rgba([(x % 256) as u8, (y % 256) as u8, 0, 255]))
}

/// Every regular file below `dir`, recursively.
pub fn files_under(dir: &std::path::Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return files,
    };

    for entry in entries {
        let path = entry.unwrap().path();
        if path.is_dir() {
            files.extend(files_under(&path));
        } else {
            files.push(path);
        }
    }

    files
}

async fn tile(
    State(counters): State<Shared>,
    Path((_z, x, y)): Path<(u8, usize, usize)>,
) -> Response {
    counters.hit();
    (
        [(header::CONTENT_TYPE, "image/png")],
        encode(tile_image(x, y), ImageFormat::Png),
    )
        .into_response()
}

async fn jpeg_tile(
    State(counters): State<Shared>,
    Path((_z, x, y)): Path<(u8, usize, usize)>,
) -> Response {
    counters.hit();
    (
        [(header::CONTENT_TYPE, "image/jpeg")],
        encode(tile_image(x, y), ImageFormat::Jpeg),
    )
        .into_response()
}

async fn broken(State(counters): State<Shared>) -> Response {
    counters.hit();
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}

async fn html(State(counters): State<Shared>) -> Response {
    counters.hit();
    ([(header::CONTENT_TYPE, "text/html")], "<html></html>").into_response()
}

async fn empty(State(counters): State<Shared>) -> Response {
    counters.hit();
    ([(header::CONTENT_TYPE, "image/png")], Vec::<u8>::new()).into_response()
}

/// Serves tiles only with the `X-Api-Key` header and the `sign` query token.
async fn authenticated(
    State(counters): State<Shared>,
    Path((_z, x, y)): Path<(u8, usize, usize)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    counters.hit();

    let key_ok = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v == API_KEY);
    let sign_ok = query.get("sign").map_or(false, |v| v == SIGN);
    if !(key_ok && sign_ok) {
        return StatusCode::FORBIDDEN.into_response();
    }

    (
        [(header::CONTENT_TYPE, "image/png")],
        encode(tile_image(x, y), ImageFormat::Png),
    )
        .into_response()
}

/// Serves tiles after a delay, recording the peak number of requests in
/// progress.
async fn slow(
    State(counters): State<Shared>,
    Path((_z, x, y)): Path<(u8, usize, usize)>,
) -> Response {
    counters.hit();
    let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    counters.max_in_flight.fetch_max(now, Ordering::SeqCst);

    tokio::time::sleep(SLOW_RESPONSE).await;

    counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    (
        [(header::CONTENT_TYPE, "image/png")],
        encode(tile_image(x, y), ImageFormat::Png),
    )
        .into_response()
}
