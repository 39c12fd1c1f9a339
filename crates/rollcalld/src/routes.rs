//! HTTP surface.
//!
//! - GET  /                      - UI page
//! - GET  /video_feed            - multipart JPEG stream
//! - GET  /api/persons           - registered persons
//! - POST /api/register          - capture and register a person
//! - GET  /api/detections        - identities from the last processed frame
//! - POST /api/reload            - re-read the store
//! - POST /api/tolerance/toggle  - switch strict/lenient tolerance
//! - GET  /api/status            - engine status

use crate::engine::EngineHandle;
use crate::error::ApiError;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Method};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::{Bytes, BytesMut};
use rollcall_core::{NewPerson, PersonRecord, Recognition};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use tower_http::cors::{AllowOrigin, CorsLayer};

const INDEX_HTML: &str = include_str!("../assets/index.html");
pub const FEED_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

pub fn router(engine: EngineHandle) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    Router::new()
        .route("/", get(index))
        .route("/video_feed", get(video_feed))
        .route("/api/persons", get(persons))
        .route("/api/register", post(register))
        .route("/api/detections", get(detections))
        .route("/api/reload", post(reload))
        .route("/api/tolerance/toggle", post(toggle_tolerance))
        .route("/api/status", get(status))
        .layer(cors)
        .with_state(engine)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// One part of the multipart feed.
fn feed_part(jpeg: &[u8]) -> Bytes {
    const HEAD: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
    let mut part = BytesMut::with_capacity(HEAD.len() + jpeg.len() + 2);
    part.extend_from_slice(HEAD);
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part.freeze()
}

async fn video_feed(State(engine): State<EngineHandle>) -> Response {
    let frames = futures_util::stream::unfold(engine, |engine| async move {
        match engine.frame().await {
            Ok(jpeg) => Some((Ok::<_, Infallible>(feed_part(&jpeg)), engine)),
            Err(e) => {
                tracing::warn!(error = %e, "video feed ended");
                None
            }
        }
    });

    (
        [
            (header::CONTENT_TYPE, FEED_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}

#[derive(Serialize)]
struct PersonsResponse {
    status: &'static str,
    persons: Vec<PersonRecord>,
}

async fn persons(State(engine): State<EngineHandle>) -> Result<Json<PersonsResponse>, ApiError> {
    let persons = engine.persons().await?;
    Ok(Json(PersonsResponse {
        status: "success",
        persons,
    }))
}

/// Registration form. Missing fields arrive empty and fail validation
/// with a 400 rather than being rejected by the JSON extractor.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RegisterRequest {
    name: String,
    #[serde(alias = "class_name")]
    class: String,
    roll_number: String,
    email: String,
    phone: String,
}

impl From<RegisterRequest> for NewPerson {
    fn from(r: RegisterRequest) -> Self {
        NewPerson {
            name: r.name,
            class: r.class,
            roll_number: r.roll_number,
            email: r.email,
            phone: r.phone,
        }
    }
}

async fn register(
    State(engine): State<EngineHandle>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<Value>, ApiError> {
    let person_id = engine.register(req.into()).await?;
    Ok(Json(json!({ "status": "success", "person_id": person_id })))
}

#[derive(Serialize)]
struct DetectionView<'a> {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    known: bool,
    label: String,
    confidence: f32,
    person: Option<&'a PersonRecord>,
}

impl<'a> From<&'a Recognition> for DetectionView<'a> {
    fn from(r: &'a Recognition) -> Self {
        Self {
            x: r.bbox.x,
            y: r.bbox.y,
            width: r.bbox.width,
            height: r.bbox.height,
            known: r.is_known(),
            label: match r.person() {
                Some(p) => format!("{} ({})", p.name, p.class),
                None => "Unknown".to_string(),
            },
            confidence: r.confidence(),
            person: r.person(),
        }
    }
}

async fn detections(State(engine): State<EngineHandle>) -> Result<Json<Value>, ApiError> {
    let (tolerance, recognitions) = engine.detections().await?;
    let views: Vec<DetectionView<'_>> = recognitions.iter().map(DetectionView::from).collect();
    Ok(Json(json!({
        "status": "success",
        "tolerance": tolerance,
        "detections": views,
    })))
}

async fn reload(State(engine): State<EngineHandle>) -> Result<Json<Value>, ApiError> {
    let count = engine.reload().await?;
    Ok(Json(json!({ "status": "success", "person_count": count })))
}

async fn toggle_tolerance(State(engine): State<EngineHandle>) -> Result<Json<Value>, ApiError> {
    let (tolerance, lenient) = engine.toggle_tolerance().await?;
    let mode = if lenient { "lenient" } else { "strict" };
    Ok(Json(json!({ "status": "success", "tolerance": tolerance, "mode": mode })))
}

async fn status(State(engine): State<EngineHandle>) -> Result<Json<Value>, ApiError> {
    let status = engine.status().await?;
    Ok(Json(json!({ "status": "success", "engine": status })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{spawn_engine, EngineOptions};
    use rollcall_core::{BoundingBox, DetectedFace, Embedding, EmbeddingProvider, ProviderError, Tolerances};
    use rollcall_hw::{CameraError, Frame, FrameSource};
    use rollcall_store::FaceStore;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    struct TestCamera;

    impl FrameSource for TestCamera {
        fn next_frame(&mut self) -> Result<Frame, CameraError> {
            Ok(Frame::solid(64, 48, [40, 80, 120]))
        }

        fn describe(&self) -> String {
            "test camera".into()
        }
    }

    /// Returns whatever faces the test currently has in view.
    #[derive(Clone, Default)]
    struct InView(Arc<Mutex<Vec<DetectedFace>>>);

    impl InView {
        fn set(&self, faces: Vec<DetectedFace>) {
            *self.0.lock().unwrap() = faces;
        }
    }

    impl EmbeddingProvider for InView {
        fn faces(&mut self, _: &[u8], _: u32, _: u32) -> Result<Vec<DetectedFace>, ProviderError> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    fn face(values: &[f32]) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox {
                x: 8.0,
                y: 8.0,
                width: 16.0,
                height: 16.0,
                confidence: 0.97,
                landmarks: None,
            },
            embedding: Embedding::new(values.to_vec()),
        }
    }

    struct TestApp {
        base: String,
        engine: EngineHandle,
        view: InView,
        store: FaceStore,
        _dir: tempfile::TempDir,
    }

    async fn spawn_app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let store = FaceStore::open(dir.path()).unwrap();
        let view = InView::default();
        let options = EngineOptions {
            mirror: true,
            warmup_frames: 1,
            capture_attempts: 5,
            frame_skip: 1,
            tolerances: Tolerances::default(),
            lenient: false,
            jpeg_quality: 70,
        };
        let engine = spawn_engine(|| Ok(TestCamera), view.clone(), store.clone(), options)
            .await
            .unwrap();

        let app = router(engine.clone());
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });

        TestApp {
            base: format!("http://127.0.0.1:{port}"),
            engine,
            view,
            store,
            _dir: dir,
        }
    }

    fn alice_form() -> Value {
        json!({ "name": "Alice", "class": "10A", "roll_number": "5", "email": "alice@school.test" })
    }

    #[tokio::test]
    async fn test_index_page() {
        let app = spawn_app().await;
        let resp = reqwest::get(format!("{}/", app.base)).await.unwrap();
        assert_eq!(resp.status(), 200);
        let html = resp.text().await.unwrap();
        assert!(html.contains("/video_feed"));
    }

    #[tokio::test]
    async fn test_persons_empty() {
        let app = spawn_app().await;
        let body: Value = reqwest::get(format!("{}/api/persons", app.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body, json!({ "status": "success", "persons": [] }));
    }

    #[tokio::test]
    async fn test_register_then_list() {
        let app = spawn_app().await;
        app.view.set(vec![face(&[0.0, 1.0, 0.0])]);

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/api/register", app.base))
            .json(&alice_form())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({ "status": "success", "person_id": 1 }));

        let body: Value = reqwest::get(format!("{}/api/persons", app.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let persons = body["persons"].as_array().unwrap();
        assert_eq!(persons.len(), 1);
        assert_eq!(persons[0]["name"], "Alice");
        assert_eq!(persons[0]["class"], "10A");
        assert_eq!(persons[0]["email"], "alice@school.test");
        assert_eq!(persons[0]["phone"], "");
    }

    #[tokio::test]
    async fn test_register_rejects_no_face_and_two_faces() {
        let app = spawn_app().await;
        let client = reqwest::Client::new();
        let url = format!("{}/api/register", app.base);

        let resp = client.post(&url).json(&alice_form()).send().await.unwrap();
        assert_eq!(resp.status(), 422);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "error");

        app.view.set(vec![face(&[0.0, 1.0]), face(&[1.0, 0.0])]);
        let resp = client.post(&url).json(&alice_form()).send().await.unwrap();
        assert_eq!(resp.status(), 422);
        let body: Value = resp.json().await.unwrap();
        assert!(body["message"].as_str().unwrap().contains("2 faces"));

        assert_eq!(app.store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_register_validation_error() {
        let app = spawn_app().await;
        app.view.set(vec![face(&[0.0, 1.0])]);
        let resp = reqwest::Client::new()
            .post(format!("{}/api/register", app.base))
            .json(&json!({ "name": "  ", "class": "10A", "roll_number": "5" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert!(body["message"].as_str().unwrap().contains("name"));
        assert_eq!(app.store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_video_feed_streams_jpeg_parts() {
        let app = spawn_app().await;
        let mut resp = reqwest::get(format!("{}/video_feed", app.base)).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()[header::CONTENT_TYPE.as_str()], FEED_CONTENT_TYPE);

        let mut received = Vec::new();
        while received.len() < 64 {
            let chunk = resp.chunk().await.unwrap().unwrap();
            received.extend_from_slice(&chunk);
        }
        let head = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
        assert_eq!(&received[..head.len()], head);
        assert_eq!(&received[head.len()..head.len() + 2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn test_detections_identify_registered_person() {
        let app = spawn_app().await;
        app.view.set(vec![face(&[0.0, 1.0, 0.0])]);
        app.engine
            .register(NewPerson {
                name: "Alice".into(),
                class: "10A".into(),
                roll_number: "5".into(),
                ..NewPerson::default()
            })
            .await
            .unwrap();

        app.engine.frame().await.unwrap();
        let body: Value = reqwest::get(format!("{}/api/detections", app.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let detections = body["detections"].as_array().unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0]["known"], true);
        assert_eq!(detections[0]["label"], "Alice (10A)");
        assert_eq!(detections[0]["person"]["roll_number"], "5");

        app.view.set(vec![face(&[5.0, 5.0, 5.0])]);
        app.engine.frame().await.unwrap();
        let body: Value = reqwest::get(format!("{}/api/detections", app.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["detections"][0]["label"], "Unknown");
        assert_eq!(body["detections"][0]["person"], Value::Null);
    }

    #[tokio::test]
    async fn test_toggle_reload_and_status() {
        let app = spawn_app().await;
        let client = reqwest::Client::new();

        let body: Value = client
            .post(format!("{}/api/tolerance/toggle", app.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["mode"], "lenient");
        assert!((body["tolerance"].as_f64().unwrap() - 0.9).abs() < 1e-6);

        // A person written behind the engine's back shows up after reload.
        app.store
            .append(
                &NewPerson {
                    name: "Bob".into(),
                    class: "9B".into(),
                    roll_number: "1".into(),
                    ..NewPerson::default()
                },
                &Embedding::new(vec![1.0, 0.0]),
            )
            .unwrap();
        let body: Value = client
            .post(format!("{}/api/reload", app.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["person_count"], 1);

        let body: Value = reqwest::get(format!("{}/api/status", app.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["engine"]["camera"], "test camera");
        assert_eq!(body["engine"]["persons"], 1);
        assert_eq!(body["engine"]["lenient"], true);
    }

    #[tokio::test]
    async fn test_reload_with_corrupt_blob_empties_snapshot() {
        let app = spawn_app().await;
        app.store
            .append(
                &NewPerson {
                    name: "Bob".into(),
                    class: "9B".into(),
                    roll_number: "1".into(),
                    ..NewPerson::default()
                },
                &Embedding::new(vec![1.0, 0.0]),
            )
            .unwrap();
        std::fs::write(app.store.blob_path(), b"garbage").unwrap();

        assert_eq!(app.engine.reload().await.unwrap(), 0);
        // The person table is still served.
        assert_eq!(app.engine.persons().await.unwrap().len(), 1);
    }
}
