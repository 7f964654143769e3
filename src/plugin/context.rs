//! The mutable record passed to every hook, and the hook's verdict
//! (spec.md §3 "Intercept context", "Intercept result").

use std::collections::HashMap;
use std::time::SystemTime;

use bytes::Bytes;
use http::{HeaderMap, Request, Response};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// Carries whichever of request/response is relevant to the phase being
/// run, plus the fields every phase shares. Hooks may mutate it in place;
/// the host observes the mutation on return (spec.md §3).
pub struct InterceptContext {
    pub request: Option<Request<Bytes>>,
    pub response: Option<Response<Bytes>>,
    pub connection_id: String,
    pub direction: Option<Direction>,
    pub body: Bytes,
    pub headers: HeaderMap,
    pub timestamp: SystemTime,
    pub metadata: HashMap<String, Value>,
    /// The originating request's URI, carried alongside a response-phase
    /// context so `match_target` still has something to glob-match against
    /// once `request` itself has been dropped.
    pub request_uri: Option<String>,
}

impl InterceptContext {
    pub fn for_request(connection_id: String, request: Request<Bytes>) -> Self {
        let headers = request.headers().clone();
        Self {
            request: Some(request),
            response: None,
            connection_id,
            direction: None,
            body: Bytes::new(),
            headers,
            timestamp: SystemTime::now(),
            metadata: HashMap::new(),
            request_uri: None,
        }
    }

    /// `request_uri` is the original request's URI, carried over from the
    /// request phase since `response` alone has no notion of what it was
    /// fetched for (spec.md §4.6 step 3 matches response hooks against it).
    pub fn for_response(connection_id: String, response: Response<Bytes>, request_uri: String) -> Self {
        let headers = response.headers().clone();
        Self {
            request: None,
            response: Some(response),
            connection_id,
            direction: None,
            body: Bytes::new(),
            headers,
            timestamp: SystemTime::now(),
            metadata: HashMap::new(),
            request_uri: Some(request_uri),
        }
    }

    pub fn for_ws_message(connection_id: String, direction: Direction, data: Bytes) -> Self {
        Self {
            request: None,
            response: None,
            connection_id,
            direction: Some(direction),
            body: data,
            headers: HeaderMap::new(),
            timestamp: SystemTime::now(),
            metadata: HashMap::new(),
            request_uri: None,
        }
    }

    pub fn for_connection(connection_id: String) -> Self {
        Self {
            request: None,
            response: None,
            connection_id,
            direction: None,
            body: Bytes::new(),
            headers: HeaderMap::new(),
            timestamp: SystemTime::now(),
            metadata: HashMap::new(),
            request_uri: None,
        }
    }

    /// The URL glob access-control checks match against: the request's URI
    /// if present (request phase), else the carried-over `request_uri`
    /// (response phase), else an empty string (never matches a non-empty
    /// allow list, always passes an absent/empty deny list).
    pub fn match_target(&self) -> String {
        self.request
            .as_ref()
            .map(|r| r.uri().to_string())
            .or_else(|| self.request_uri.clone())
            .unwrap_or_default()
    }
}

/// `{continue, modified, message, metadata}` (spec.md §3). `r#continue` is
/// spelled out because `continue` is a reserved word.
#[derive(Debug, Clone)]
pub struct InterceptResult {
    pub r#continue: bool,
    pub modified: bool,
    pub message: Option<String>,
    pub metadata: HashMap<String, Value>,
}

impl InterceptResult {
    pub fn proceed() -> Self {
        Self {
            r#continue: true,
            modified: false,
            message: None,
            metadata: HashMap::new(),
        }
    }

    pub fn modified() -> Self {
        Self {
            modified: true,
            ..Self::proceed()
        }
    }

    pub fn block(message: impl Into<String>) -> Self {
        Self {
            r#continue: false,
            modified: false,
            message: Some(message.into()),
            metadata: HashMap::new(),
        }
    }
}
