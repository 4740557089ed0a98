//! Session configuration.

use std::fmt;
use std::time::Duration;

use crate::protocol::subscription;

/// Default per-request wait.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the obs-websocket server listens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Build an endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `ws://host:port` URL.
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new("localhost", 4455)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Everything a [`Session`](crate::Session) needs to connect.
#[derive(Clone)]
pub struct SessionConfig {
    /// Server address.
    pub endpoint: Endpoint,
    /// Shared secret, if the server requires authentication.
    pub password: Option<String>,
    /// Bitmask sent in `Identify`.
    pub event_subscriptions: u32,
    /// How long an ordinary caller waits for a response.
    pub request_timeout: Duration,
}

impl SessionConfig {
    /// Config for `endpoint` with defaults for everything else.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            password: None,
            event_subscriptions: subscription::ALL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the shared secret.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the event subscription mask.
    #[must_use]
    pub fn with_event_subscriptions(mut self, mask: u32) -> Self {
        self.event_subscriptions = mask;
        self
    }

    pub(crate) fn request_timeout_ms(&self) -> u64 {
        u64::try_from(self.request_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(Endpoint::default())
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("endpoint", &self.endpoint)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("event_subscriptions", &self.event_subscriptions)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}
