use std::{io, sync::Arc, time::Duration};

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE, EXPIRES, PRAGMA},
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use crate::{
    app_state::AppState,
    core::errors::AppError,
    relay::{encode::MultipartEncoder, session::RelaySession},
    shared::{role::RoleLock, slot::SharedSlot},
};

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Open-ended MJPEG response. Every request gets its own session that
/// joins the writer election for the configured camera; the upstream
/// details never appear in the response.
pub async fn stream(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let config = &state.config;

    let slot = SharedSlot::open(&config.shared_dir, &config.relay_name, config.max_frame_bytes)
        .map_err(|err| AppError::internal(format!("failed to open shared slot: {err}")))?;
    let role = RoleLock::open(&config.shared_dir, &config.relay_name)
        .map_err(|err| AppError::internal(format!("failed to open writer lock: {err}")))?;

    let encoder = MultipartEncoder::new(config.boundary_out.clone());
    let content_type = HeaderValue::from_str(&encoder.content_type())
        .map_err(|err| AppError::internal(format!("invalid outbound boundary: {err}")))?;

    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(2);
    let session = RelaySession::new(
        state.upstream.clone(),
        slot,
        role,
        encoder,
        tx,
        config.boundary_in.clone(),
        Duration::from_secs(config.max_frame_age_seconds),
        Duration::from_secs(config.stream_time_limit_seconds),
    );
    tokio::spawn(async move {
        session.run().await;
        info!("stream session closed");
    });

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, content_type);
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(
        EXPIRES,
        HeaderValue::from_static("Sat, 01 Jan 2000 01:00:00 GMT"),
    );

    Ok((
        StatusCode::OK,
        headers,
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::Arc,
        time::{SystemTime, UNIX_EPOCH},
    };

    use anyhow::Result;
    use async_trait::async_trait;
    use axum::{
        extract::State,
        http::{StatusCode, header::CONTENT_TYPE},
    };

    use crate::{
        app_state::AppState,
        config::AppConfig,
        upstream::connector::{ByteSource, UpstreamBackend},
    };

    use super::stream;

    struct SilentUpstream;

    #[async_trait]
    impl UpstreamBackend for SilentUpstream {
        async fn open(&self) -> Result<ByteSource> {
            Ok(Box::new(std::io::Cursor::new(Vec::new())))
        }
    }

    fn test_state() -> Arc<AppState> {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        let config = AppConfig {
            app_name: "restreamer".to_string(),
            bind_addr: "127.0.0.1:8080"
                .parse::<SocketAddr>()
                .expect("socket addr should parse"),
            upstream_host: "127.0.0.1".to_string(),
            upstream_port: 80,
            upstream_path: "/".to_string(),
            upstream_tls: false,
            upstream_accept_invalid_certs: false,
            upstream_auth: None,
            client_user: "viewer".to_string(),
            client_pass: "secret".to_string(),
            boundary_out: "testboundary".to_string(),
            boundary_in: None,
            stream_time_limit_seconds: 1,
            max_frame_age_seconds: 5,
            max_frame_bytes: 1024 * 1024,
            shared_dir: std::env::temp_dir().join(format!("restreamer-web-{suffix}")),
            relay_name: "camera0".to_string(),
        };
        Arc::new(AppState::new(config, Arc::new(SilentUpstream)))
    }

    #[tokio::test]
    async fn stream_response_advertises_the_outbound_boundary() {
        let state = test_state();
        let response = stream(State(state))
            .await
            .expect("stream handler should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .expect("content type should be present")
            .to_str()
            .expect("content type should be a string");
        assert_eq!(
            content_type,
            "multipart/x-mixed-replace; boundary=testboundary"
        );
        assert_eq!(
            response
                .headers()
                .get("cache-control")
                .expect("cache-control should be present"),
            "no-cache"
        );
    }
}
