// src/utils/security.rs
//! Security utilities for the application.
//!
//! This module provides connection rate limiting and input validation
//! helpers shared by the protocol and registry layers.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::constants::MAX_CLIENT_ID_LEN;
use crate::utils::logging::log_security_event;

/// Fixed-window limiter for new connections per source IP
#[derive(Debug)]
pub struct RateLimiter {
    /// Map of IP to (count, window start)
    connections: Mutex<HashMap<IpAddr, (usize, Instant)>>,
    /// Maximum connections per window
    max_connections: usize,
    /// Time window for rate limiting
    window: Duration,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new(max_connections: usize, window: Duration) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            max_connections,
            window,
        }
    }

    /// Record a connection attempt; returns false if the IP is over its limit
    pub fn check_rate_limit(&self, ip: &IpAddr) -> bool {
        let mut connections = self.connections.lock();
        let now = Instant::now();

        connections.retain(|_, (_, started)| now.duration_since(*started) < self.window);

        let entry = connections.entry(*ip).or_insert((0, now));
        entry.0 += 1;

        if entry.0 > self.max_connections {
            log_security_event(
                "RATE_LIMIT_EXCEEDED",
                &format!("IP {} exceeded connection rate limit", ip),
            );
            debug!("Rate limit exceeded for IP: {}", ip);
            false
        } else {
            true
        }
    }

    /// Number of IPs currently tracked
    pub fn tracked_ips(&self) -> usize {
        self.connections.lock().len()
    }
}

/// Security-related string validation utilities
pub struct StringValidator;

impl StringValidator {
    /// Client ids are 1..=128 chars of `[A-Za-z0-9_.@-]`
    pub fn is_valid_client_id(id: &str) -> bool {
        !id.is_empty()
            && id.len() <= MAX_CLIENT_ID_LEN
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '@'))
    }

    /// Sanitize a log message to prevent log injection
    pub fn sanitize_log(input: &str) -> String {
        input
            .replace('\n', "\\n")
            .replace('\r', "\\r")
            .replace('\t', "\\t")
    }

    /// Reduce an identifier to characters safe for use in a file name
    pub fn sanitize_identifier(input: &str) -> String {
        input
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_rate_limiter() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let ip = "127.0.0.1".parse::<IpAddr>().unwrap();

        assert!(limiter.check_rate_limit(&ip));
        assert!(limiter.check_rate_limit(&ip));
        assert!(limiter.check_rate_limit(&ip));
        assert!(!limiter.check_rate_limit(&ip));

        let other = "10.0.0.1".parse::<IpAddr>().unwrap();
        assert!(limiter.check_rate_limit(&other));
        assert_eq!(limiter.tracked_ips(), 2);
    }

    #[test]
    fn test_rate_limiter_window_expiry() {
        let limiter = RateLimiter::new(1, Duration::from_millis(20));
        let ip = "127.0.0.1".parse::<IpAddr>().unwrap();

        assert!(limiter.check_rate_limit(&ip));
        assert!(!limiter.check_rate_limit(&ip));
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.check_rate_limit(&ip));
        assert_eq!(limiter.tracked_ips(), 1);
    }

    #[test_case("alice", true)]
    #[test_case("svc.worker-01@lab", true)]
    #[test_case("", false)]
    #[test_case("../etc/passwd", false)]
    #[test_case("has space", false)]
    fn test_client_id_validation(id: &str, valid: bool) {
        assert_eq!(StringValidator::is_valid_client_id(id), valid);
    }

    #[test]
    fn test_client_id_length_limit() {
        let long = "a".repeat(MAX_CLIENT_ID_LEN + 1);
        assert!(!StringValidator::is_valid_client_id(&long));
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(StringValidator::sanitize_log("hello\nworld"), "hello\\nworld");
        assert_eq!(StringValidator::sanitize_identifier("svc.worker@lab"), "svc_worker_lab");
    }
}
