//! Shared fixtures for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use chrono::{Duration, TimeZone, Utc};
use tokio::net::TcpListener;

use crate::protocol::telemetry::{GpsFix, Motion, VALID_DATE, VALID_TIME};
use crate::protocol::TelemetryRecord;

/// Deterministic record number `seq` of a 25Hz stream
///
/// Float fields use binary-exact values so equality survives serialization.
pub fn sample_record(seq: u32) -> TelemetryRecord {
    let start = Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap();
    let step = seq as f64;

    TelemetryRecord {
        itow_ms: 345_600_000 + seq * 40,
        timestamp: start + Duration::milliseconds(seq as i64 * 40),
        gps: GpsFix {
            latitude: 47.375 + step / 1024.0,
            longitude: 8.5,
            altitude_ellipsoid_m: 456.75,
            altitude_msl_m: 408.125,
            speed_kmh: 36.0,
            heading_deg: 90.0,
            satellites: 14,
            fix_type: 3,
            horizontal_accuracy_m: 1.5,
            vertical_accuracy_m: 2.25,
            speed_accuracy_mps: 0.25,
            heading_accuracy_deg: 1.5,
            fix_valid: true,
        },
        motion: Motion {
            g_x: -0.25,
            g_y: 0.125,
            g_z: 1.0,
            rot_x: 15.5,
            rot_y: -3.0,
            rot_z: 0.0625,
        },
        battery_percent: 87,
        battery_voltage: Some(3.875),
        is_charging: false,
        time_accuracy_ns: 25,
        validity_flags: VALID_DATE | VALID_TIME,
    }
}

/// Request seen by a [`Responder`]
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Collector stand-in answering every request from a script of `(status, body)` pairs
///
/// The last scripted response repeats once the script is exhausted.
pub struct Responder {
    pub base_url: String,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

#[derive(Clone)]
struct Script {
    responses: Arc<Vec<(u16, &'static str)>>,
    served: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl Responder {
    pub async fn start(script: Vec<(u16, &'static str)>) -> Self {
        assert!(!script.is_empty(), "script needs at least one response");

        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = Script {
            responses: Arc::new(script),
            served: Arc::new(AtomicUsize::new(0)),
            requests: requests.clone(),
        };
        let app = Router::new().fallback(answer).with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            requests,
        }
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn hits(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

async fn answer(
    State(script): State<Script>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let served = script.served.fetch_add(1, Ordering::SeqCst);
    let (status, text) = script.responses[served.min(script.responses.len() - 1)];

    // Recorded before answering so callers observe it as soon as they get a response
    script.requests.lock().unwrap().push(CapturedRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        headers: headers
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_str().unwrap_or_default().to_string()))
            .collect(),
        body: body.to_vec(),
    });

    let status = StatusCode::from_u16(status).unwrap();
    (status, [(header::CONTENT_TYPE, "application/json")], text).into_response()
}
