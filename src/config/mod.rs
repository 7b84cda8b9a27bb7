use std::{env, net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result, bail};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub bind_addr: SocketAddr,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub upstream_path: String,
    pub upstream_tls: bool,
    pub upstream_accept_invalid_certs: bool,
    pub upstream_auth: Option<String>,
    pub client_user: String,
    pub client_pass: String,
    pub boundary_out: String,
    pub boundary_in: Option<String>,
    pub stream_time_limit_seconds: u64,
    pub max_frame_age_seconds: u64,
    pub max_frame_bytes: usize,
    pub shared_dir: PathBuf,
    pub relay_name: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let app_name = env_or("APP_NAME", "restreamer");
        let bind_addr = env_or("BIND_ADDR", "0.0.0.0:8080")
            .parse()
            .context("BIND_ADDR must be a host:port pair")?;

        let upstream_host = env_or("UPSTREAM_HOST", "127.0.0.1");
        let upstream_port = env_or("UPSTREAM_PORT", "80")
            .parse::<u16>()
            .context("UPSTREAM_PORT must be a port number")?;
        let upstream_path = env_or("UPSTREAM_PATH", "/");
        let upstream_tls = env_bool("UPSTREAM_TLS", false);
        let upstream_accept_invalid_certs = env_bool("UPSTREAM_ACCEPT_INVALID_CERTS", false);
        let upstream_auth = env_opt("UPSTREAM_AUTH");
        if let Some(auth) = &upstream_auth {
            if !auth.contains(':') {
                bail!("UPSTREAM_AUTH must look like user:password");
            }
        }

        let client_user = env_or("CLIENT_USER", "viewer");
        let client_pass = env_or("CLIENT_PASS", "change-me");

        let boundary_out = env_or("BOUNDARY_OUT", "restreamerframe");
        let boundary_in = env_opt("BOUNDARY_IN");

        let stream_time_limit_seconds = env_or("STREAM_TIME_LIMIT_SECONDS", "100")
            .parse()
            .context("STREAM_TIME_LIMIT_SECONDS must be a number of seconds")?;
        let max_frame_age_seconds = env_or("MAX_FRAME_AGE_SECONDS", "5")
            .parse()
            .context("MAX_FRAME_AGE_SECONDS must be a number of seconds")?;
        let max_frame_bytes = env_or("MAX_FRAME_BYTES", "4194304")
            .parse()
            .context("MAX_FRAME_BYTES must be a byte count")?;

        let shared_dir = PathBuf::from(env_or("SHARED_DIR", "/dev/shm/restreamer"));
        let relay_name = env_or("RELAY_NAME", "camera0");

        Ok(Self {
            app_name,
            bind_addr,
            upstream_host,
            upstream_port,
            upstream_path,
            upstream_tls,
            upstream_accept_invalid_certs,
            upstream_auth,
            client_user,
            client_pass,
            boundary_out,
            boundary_in,
            stream_time_limit_seconds,
            max_frame_age_seconds,
            max_frame_bytes,
            shared_dir,
            relay_name,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
        .unwrap_or(default)
}
