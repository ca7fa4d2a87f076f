//! HTTP request runner
//!
//! Every operation against a RobustIRC network is an HTTP request. This
//! module owns the two `reqwest` client pools a session drives its
//! requests through, and the classification of completed requests into
//! success, temporary failure, and permanent failure.
//!
//! # Two pools
//!
//! Short request/response calls (CreateSession, PostMessage) and the
//! never-ending GetMessages long-poll use separate clients so that a
//! stuck long-poll cannot stall POSTs behind it on the same connection.
//! Both pools keep at most one idle connection per `host:port` and speak
//! HTTP/1.1 only: ordering across a connection must not depend on HTTP/2
//! stream multiplexing.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use reqwest::StatusCode;

use crate::config::{AddressFamily, SessionConfig};
use crate::error::Result;
use crate::session::request::RequestKind;

/// Fixed product token sent as `User-Agent` on every request.
pub(crate) const USER_AGENT: &str = concat!("robustsession/", env!("CARGO_PKG_VERSION"));

/// Maximum time to establish a TCP/TLS connection.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total timeout for short request/response calls.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A GetMessages stream without a RobustPing for this long is considered
/// dead and reconnected against a freshly picked target.
pub(crate) const GETMESSAGES_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// The two per-session HTTP client pools.
#[derive(Debug, Clone)]
pub(crate) struct HttpRunner {
    short: reqwest::Client,
    stream: reqwest::Client,
}

impl HttpRunner {
    /// Build both pools from the session configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if TLS backend initialisation fails.
    pub(crate) fn new(config: &SessionConfig) -> Result<Self> {
        let short = Self::builder(config).timeout(REQUEST_TIMEOUT).build()?;
        // No total timeout: GetMessages is an infinite long-poll kept
        // alive by RobustPing frames.
        let stream = Self::builder(config).build()?;
        Ok(Self { short, stream })
    }

    fn builder(config: &SessionConfig) -> reqwest::ClientBuilder {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .http1_only()
            .pool_max_idle_per_host(1);
        if !config.tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        match config.family {
            AddressFamily::Unspec => {}
            AddressFamily::V4 => {
                builder = builder.local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            }
            AddressFamily::V6 => {
                builder = builder.local_address(IpAddr::V6(Ipv6Addr::UNSPECIFIED));
            }
        }
        builder
    }

    /// Client for short request/response calls (30 s total timeout).
    pub(crate) fn short(&self) -> &reqwest::Client {
        &self.short
    }

    /// Client for the GetMessages long-poll (no total timeout).
    pub(crate) fn stream(&self) -> &reqwest::Client {
        &self.stream
    }
}

/// Classification of a completed HTTP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// The request did what it was supposed to.
    Success,
    /// Back off the target and retry against a freshly picked one.
    Temporary,
    /// Tear the session down.
    Permanent,
}

/// Classify a completed request by HTTP status.
///
/// Transport-level errors never reach this function; they are always
/// temporary. 5xx statuses are temporary as well. A 2xx on GetMessages
/// means the server closed the never-ending stream, likely because it is
/// partitioned from the cluster, so it counts as a temporary failure.
/// Everything else is permanent.
pub(crate) fn classify(kind: RequestKind, status: StatusCode) -> Disposition {
    if status.is_server_error() {
        return Disposition::Temporary;
    }
    if status.is_success() {
        return if kind == RequestKind::GetMessages {
            Disposition::Temporary
        } else {
            Disposition::Success
        };
    }
    Disposition::Permanent
}

/// Assemble the request URL for `target` from the stable URL suffix.
pub(crate) fn request_url(plaintext: bool, target: &str, url_suffix: &str) -> String {
    let scheme = if plaintext { "http" } else { "https" };
    format!("{scheme}://{target}{url_suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_5xx_is_temporary() {
        for kind in [
            RequestKind::CreateSession,
            RequestKind::PostMessage,
            RequestKind::GetMessages,
        ] {
            assert_eq!(
                classify(kind, StatusCode::SERVICE_UNAVAILABLE),
                Disposition::Temporary
            );
        }
    }

    #[test]
    fn test_classify_2xx_success_for_short_requests() {
        assert_eq!(
            classify(RequestKind::CreateSession, StatusCode::OK),
            Disposition::Success
        );
        assert_eq!(
            classify(RequestKind::PostMessage, StatusCode::OK),
            Disposition::Success
        );
    }

    #[test]
    fn test_classify_2xx_getmessages_is_temporary() {
        // A finished long-poll means the server closed the stream.
        assert_eq!(
            classify(RequestKind::GetMessages, StatusCode::OK),
            Disposition::Temporary
        );
    }

    #[test]
    fn test_classify_other_statuses_are_permanent() {
        assert_eq!(
            classify(RequestKind::PostMessage, StatusCode::FORBIDDEN),
            Disposition::Permanent
        );
        assert_eq!(
            classify(RequestKind::GetMessages, StatusCode::NOT_FOUND),
            Disposition::Permanent
        );
    }

    #[test]
    fn test_request_url_schemes() {
        assert_eq!(
            request_url(false, "a:60667", "/robustirc/v1/session"),
            "https://a:60667/robustirc/v1/session"
        );
        assert_eq!(
            request_url(true, "a:60667", "/robustirc/v1/session"),
            "http://a:60667/robustirc/v1/session"
        );
    }

    #[test]
    fn test_runner_builds_with_defaults() {
        let config = crate::config::SessionConfig::new("robustirc.net");
        assert!(HttpRunner::new(&config).is_ok());
    }

    #[test]
    fn test_user_agent_is_product_token() {
        assert!(USER_AGENT.starts_with("robustsession/"));
    }
}
