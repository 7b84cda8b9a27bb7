use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{
        HeaderMap, StatusCode,
        header::{AUTHORIZATION, WWW_AUTHENTICATE},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD};

use crate::app_state::AppState;

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let encoded = raw.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_owned(), pass.to_owned()))
}

/// Query-string grant: a parameter named after the configured user whose
/// value is the configured password, so `<img>` tags can authenticate
/// without headers.
fn query_grants_access(query: Option<&str>, user: &str, pass: &str) -> bool {
    let Some(query) = query else {
        return false;
    };
    query.split('&').any(|pair| match pair.split_once('=') {
        Some((name, value)) => name == user && value == pass,
        None => false,
    })
}

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response<Body>, Response<Body>> {
    let config = &state.config;

    let authorized = query_grants_access(
        request.uri().query(),
        &config.client_user,
        &config.client_pass,
    ) || basic_credentials(request.headers())
        .map(|(user, pass)| user == config.client_user && pass == config.client_pass)
        .unwrap_or(false);

    if authorized {
        return Ok(next.run(request).await);
    }

    Err((
        StatusCode::UNAUTHORIZED,
        [(WWW_AUTHENTICATE, "Basic realm=\"Webcam\"")],
        "credentials required",
    )
        .into_response())
}
