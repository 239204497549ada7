use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::{error::ApiError, state::AppState};

/// Global window: 300 requests per 5 minutes per peer.
pub const GLOBAL_LIMIT: RateLimitConfig = RateLimitConfig::new(300, 300);
/// Pairing window: 10 requests per 10 minutes per peer.
pub const PAIRING_LIMIT: RateLimitConfig = RateLimitConfig::new(10, 600);

#[derive(Clone, Copy, Debug)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl RateLimitConfig {
    pub const fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }
}

struct Bucket {
    timestamps: Vec<Instant>,
}

impl Bucket {
    fn check_and_record(&mut self, window_secs: u64, max_requests: u32) -> bool {
        let now = Instant::now();
        let cutoff = now - Duration::from_secs(window_secs);
        self.timestamps.retain(|t| *t > cutoff);

        if (self.timestamps.len() as u32) < max_requests {
            self.timestamps.push(now);
            true
        } else {
            false
        }
    }
}

/// Sliding-window limiter keyed by peer IP. Stale peers are swept
/// periodically to bound memory.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
    last_gc: Mutex<Instant>,
}

const GC_INTERVAL_SECS: u64 = 300;

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
            last_gc: Mutex::new(Instant::now()),
        }
    }

    pub fn check(&self, ip: IpAddr) -> bool {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());

        {
            let mut last_gc = self.last_gc.lock().unwrap_or_else(|e| e.into_inner());
            if last_gc.elapsed().as_secs() >= GC_INTERVAL_SECS {
                let cutoff = Instant::now() - Duration::from_secs(self.config.window_secs * 2);
                buckets.retain(|_, b| b.timestamps.last().is_some_and(|t| *t > cutoff));
                *last_gc = Instant::now();
            }
        }

        let bucket = buckets
            .entry(ip)
            .or_insert_with(|| Bucket { timestamps: Vec::new() });
        bucket.check_and_record(self.config.window_secs, self.config.max_requests)
    }

    pub fn tracked_peers(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
    }
}

fn host_is_local(host_header: &str) -> bool {
    // Strip any port suffix; bracketed IPv6 hosts are not in the accept set.
    let hostname = host_header
        .rsplit_once(':')
        .map(|(host, port)| if port.chars().all(|c| c.is_ascii_digit()) { host } else { host_header })
        .unwrap_or(host_header);
    matches!(hostname.to_ascii_lowercase().as_str(), "127.0.0.1" | "localhost")
}

fn peer_ip(request: &Request) -> Option<IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
}

fn apply_cors(response: &mut Response, origin: &HeaderValue) {
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
    headers.insert(header::VARY, HeaderValue::from_static("Origin"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Authorization, Content-Type"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET,POST,OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("600"),
    );
}

/// Ordered admission pipeline: loopback peer, Host header, Origin
/// allowlist, then rate limits. The first filter to reject wins. Accepted
/// responses echo the caller's origin in CORS headers; allowed preflights
/// short-circuit to 204.
pub async fn admission_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let peer = peer_ip(&request)
        .ok_or_else(|| ApiError::OriginNotAllowed("peer address unavailable".to_string()))?;
    if !is_loopback(peer) {
        warn!(%peer, "rejected non-loopback peer");
        return Err(ApiError::OriginNotAllowed("non-loopback peer".to_string()));
    }

    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !host_is_local(host) {
        warn!(host, "rejected foreign Host header");
        return Err(ApiError::OriginNotAllowed("host not allowed".to_string()));
    }

    let origin_value = request
        .headers()
        .get(header::ORIGIN)
        .cloned()
        .filter(|v| !v.is_empty());
    let Some(origin_value) = origin_value else {
        return Err(ApiError::OriginNotAllowed("missing Origin header".to_string()));
    };
    let origin = origin_value
        .to_str()
        .map_err(|_| ApiError::OriginNotAllowed("malformed Origin header".to_string()))?
        .to_string();

    let allowed = state
        .config
        .get()
        .origin_allowlist
        .iter()
        .any(|entry| entry == &origin);
    if !allowed {
        warn!(origin, "rejected origin outside allowlist");
        return Err(ApiError::OriginNotAllowed(origin));
    }

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors(&mut response, &origin_value);
        return Ok(response);
    }

    if !state.global_limiter.check(peer) {
        return Err(ApiError::RateLimited("too many requests".to_string()));
    }
    if request.uri().path().starts_with("/v1/pair") && !state.pairing_limiter.check(peer) {
        return Err(ApiError::RateLimited("too many pairing attempts".to_string()));
    }

    let mut response = next.run(request).await;
    apply_cors(&mut response, &origin_value);
    Ok(response)
}

pub fn request_origin(request: &Request) -> Option<String> {
    request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::{RateLimitConfig, RateLimiter, host_is_local, is_loopback};
    use std::net::IpAddr;

    #[test]
    fn allows_within_limit() {
        let limiter = RateLimiter::new(RateLimitConfig::new(3, 60));
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(!limiter.check(ip));
    }

    #[test]
    fn separate_peers_are_independent() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1, 60));
        let ip1: IpAddr = "127.0.0.1".parse().unwrap();
        let ip2: IpAddr = "::1".parse().unwrap();

        assert!(limiter.check(ip1));
        assert!(!limiter.check(ip1));
        assert!(limiter.check(ip2));
    }

    #[test]
    fn loopback_detection_covers_mapped_addresses() {
        assert!(is_loopback("127.0.0.1".parse().unwrap()));
        assert!(is_loopback("127.0.0.53".parse().unwrap()));
        assert!(is_loopback("::1".parse().unwrap()));
        assert!(is_loopback("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!is_loopback("192.168.1.10".parse().unwrap()));
        assert!(!is_loopback("::ffff:10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn host_check_accepts_local_names_with_ports() {
        assert!(host_is_local("127.0.0.1"));
        assert!(host_is_local("127.0.0.1:8417"));
        assert!(host_is_local("localhost"));
        assert!(host_is_local("LocalHost:3000"));
        assert!(!host_is_local("example.com"));
        assert!(!host_is_local("example.com:8417"));
        assert!(!host_is_local("127.0.0.1.evil.com"));
    }
}
