//! Descriptions of outbound actions subject to rate limiting.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::tracker::WindowAlgorithm;

/// What kind of outbound action is being limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// An HTTP request
    Request,
    /// A socket connection attempt
    Connection,
}

/// HTTP method of a request action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque identity of an API credential.
///
/// Only the first 8 bytes of the secret's SHA-256 digest are kept, so the raw
/// credential can never end up in a log line or a tracker key. The value is
/// the same across processes and builds.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApiKeyId(u64);

impl ApiKeyId {
    /// Derive an identity from the raw API key.
    pub fn from_secret(secret: &str) -> Self {
        let digest = ring::digest::digest(&ring::digest::SHA256, secret.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest.as_ref()[..8]);
        Self(u64::from_be_bytes(prefix))
    }

    /// Wrap a hash computed elsewhere.
    pub fn from_hash(hash: u64) -> Self {
        Self(hash)
    }
}

impl fmt::Debug for ApiKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKeyId({:016x})", self.0)
    }
}

impl fmt::Display for ApiKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A limit declared by the endpoint itself rather than by the guard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EndpointLimit {
    /// Maximum weight per period
    pub limit: u32,
    /// Length of the window
    pub period: Duration,
    /// Windowing algorithm for the tracker
    pub algorithm: WindowAlgorithm,
}

impl EndpointLimit {
    /// A fixed-window endpoint limit.
    pub fn new(limit: u32, period: Duration) -> Self {
        Self {
            limit,
            period,
            algorithm: WindowAlgorithm::Fixed,
        }
    }

    /// Use a different windowing algorithm.
    pub fn with_algorithm(mut self, algorithm: WindowAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }
}

/// One outbound request or connection attempt.
///
/// Built once per call by the dispatch layer and handed to the gate for both
/// the check and the apply phase.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionDescriptor {
    /// Request or connection
    pub kind: ActionKind,
    /// Target host, e.g. `api.exchange.com`
    pub host: String,
    /// Request path or socket path
    pub path: String,
    /// HTTP method, if this is a request
    pub method: Option<HttpMethod>,
    /// Whether the request carries a signature
    pub signed: bool,
    /// Credential used for the request
    pub api_key: Option<ApiKeyId>,
    /// Cost against each applicable limit (at least 1)
    pub weight: u32,
    /// Limit declared by the endpoint definition
    pub endpoint_limit: Option<EndpointLimit>,
}

impl ActionDescriptor {
    /// Describe an HTTP request.
    pub fn request(host: impl Into<String>, path: impl Into<String>, method: HttpMethod) -> Self {
        Self {
            kind: ActionKind::Request,
            host: host.into(),
            path: path.into(),
            method: Some(method),
            signed: false,
            api_key: None,
            weight: 1,
            endpoint_limit: None,
        }
    }

    /// Describe a socket connection attempt.
    pub fn connection(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Connection,
            host: host.into(),
            path: path.into(),
            method: None,
            signed: false,
            api_key: None,
            weight: 1,
            endpoint_limit: None,
        }
    }

    /// Set the weight. Zero is raised to one.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    /// Mark the action as signed with the given credential.
    pub fn signed_with(mut self, api_key: ApiKeyId) -> Self {
        self.signed = true;
        self.api_key = Some(api_key);
        self
    }

    /// Attach a credential without marking the action signed.
    pub fn with_api_key(mut self, api_key: ApiKeyId) -> Self {
        self.api_key = Some(api_key);
        self
    }

    /// Attach the endpoint's own limit.
    pub fn with_endpoint_limit(mut self, limit: EndpointLimit) -> Self {
        self.endpoint_limit = Some(limit);
        self
    }

    /// Key identifying the endpoint: the path plus method when present.
    pub fn endpoint_key(&self) -> String {
        match self.method {
            Some(method) => format!("{}{}", self.path, method),
            None => self.path.clone(),
        }
    }
}

impl fmt::Display for ActionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ActionKind::Request => "request",
            ActionKind::Connection => "connection",
        };
        match self.method {
            Some(method) => write!(f, "{} {} {}{}", kind, method, self.host, self.path)?,
            None => write!(f, "{} {}{}", kind, self.host, self.path)?,
        }
        write!(f, " (weight {})", self.weight)
    }
}
