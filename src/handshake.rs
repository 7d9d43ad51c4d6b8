//! Opening handshake (RFC 6455 section 4)
//!
//! Server side: [`HandshakeNegotiator`] validates the upgrade preconditions
//! and builds the 101 response. Client side: [`ClientHandshake`] generates
//! the nonce, builds the upgrade request and verifies the accept value.
//! Both sides share [`derive_accept_key`].
//!
//! An example client request and the expected exchange:
//!
//! ```text
//! GET /chat HTTP/1.1
//! Host: example.com:8000
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//! ```

use std::sync::Arc;

use base64::prelude::*;
use http::header::{
    CONNECTION, CONTENT_LENGTH, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{HeaderMap, Method, Request, Response, StatusCode, Version};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::error::{Error, Result};
use crate::frame::FrameContext;

/// Magic GUID appended to the client key before hashing (RFC 6455 section 1.3)
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this implementation speaks
pub const SUPPORTED_VERSION: u16 = 13;

/// Compute the `Sec-WebSocket-Accept` value for a client key.
///
/// SHA-1 over the ASCII concatenation of the key and the RFC magic GUID,
/// Base64-encoded. Deterministic and pure; both sides must produce exactly
/// this construction for the upgrade to succeed.
pub fn derive_accept_key(client_key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(client_key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Generate a fresh client nonce: 18 random bytes, Base64-encoded
pub fn generate_client_key() -> String {
    let nonce: [u8; 18] = rand::random();
    BASE64_STANDARD.encode(nonce)
}

/// Identity attached to a connection by the upgrade authorizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Authenticated principal name
    pub principal: String,
    /// Resolved device identifier, if any
    pub device: Option<String>,
}

/// External authorization hook consulted during upgrade negotiation.
///
/// Rejections should use [`Error::upgrade_precondition`] with 401 or 403;
/// the negotiator passes them through unchanged. Returning `Ok(None)`
/// admits the connection anonymously.
pub trait UpgradeAuthorizer: Send + Sync {
    fn authorize(&self, request: &Request<()>) -> Result<Option<Identity>>;
}

/// Outcome of server-side negotiation.
#[derive(Debug)]
pub enum Negotiation {
    /// The upgrade was accepted; install the codec pair and send `response`
    Upgraded(ServerUpgrade),
    /// The request did not attempt a WebSocket upgrade and upgrades are
    /// optional on this path; let the regular HTTP stack handle it
    NotUpgrade,
    /// The request did not attempt an upgrade but this path requires one;
    /// answer with the enclosed 426 response
    UpgradeRequired(Response<()>),
}

/// A successful upgrade: the 101 response plus the session parameters the
/// connection needs to build its [`FrameContext`].
#[derive(Debug)]
pub struct ServerUpgrade {
    /// The 101 Switching Protocols response to send
    pub response: Response<()>,
    /// Request path (including any query) the connection upgraded on
    pub path: String,
    /// Negotiated protocol version
    pub version: u16,
    /// Sub-protocols the client offered, in offer order
    pub protocols: Vec<String>,
    /// The sub-protocol echoed back, if any were offered
    pub selected_protocol: Option<String>,
    /// Identity supplied by the authorizer
    pub identity: Option<Identity>,
}

impl ServerUpgrade {
    /// Context to stamp on every frame decoded on this connection
    pub fn frame_context(&self) -> FrameContext {
        let mut context = FrameContext::new(
            self.path.clone(),
            self.version,
            self.protocols.clone(),
        );
        if let Some(identity) = &self.identity {
            context.principal = Some(identity.principal.clone());
            context.device = identity.device.clone();
        }
        context
    }
}

/// Server-side upgrade validation and response construction.
#[derive(Default)]
pub struct HandshakeNegotiator {
    require_upgrade: bool,
    authorizer: Option<Arc<dyn UpgradeAuthorizer>>,
}

impl HandshakeNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer non-upgrade requests with 426 instead of passing them through
    pub fn require_upgrade(mut self, require: bool) -> Self {
        self.require_upgrade = require;
        self
    }

    /// Install an authorization hook consulted before the upgrade is accepted
    pub fn with_authorizer(mut self, authorizer: Arc<dyn UpgradeAuthorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Validate `request` and build the switching response.
    ///
    /// A request counts as an attempted upgrade when it carries a
    /// `Connection` header with an `Upgrade` token and `Upgrade: websocket`;
    /// only then do the remaining preconditions apply, failing with
    /// [`Error::UpgradePrecondition`] (status 400, or 401/403 from the
    /// authorizer). Such failures are recoverable at the HTTP layer: answer
    /// with [`rejection_response`] rather than dropping the transport.
    pub fn negotiate(&self, request: &Request<()>) -> Result<Negotiation> {
        let headers = request.headers();
        let attempted = header_has_token(headers, CONNECTION.as_str(), "upgrade")
            && header_value(headers, UPGRADE.as_str())
                .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

        if !attempted {
            if self.require_upgrade {
                return Ok(Negotiation::UpgradeRequired(upgrade_required_response()));
            }
            return Ok(Negotiation::NotUpgrade);
        }

        if request.method() != Method::GET {
            return Err(Error::upgrade_precondition(
                400,
                format!("upgrade request must use GET, not {}", request.method()),
            ));
        }
        if request.version() < Version::HTTP_11 {
            return Err(Error::upgrade_precondition(
                400,
                "upgrade request requires HTTP/1.1 or later",
            ));
        }

        // Exactly one protocol version is supported; anything else is
        // rejected rather than downgraded.
        match header_value(headers, SEC_WEBSOCKET_VERSION.as_str()) {
            Some(version) if version == SUPPORTED_VERSION.to_string() => {}
            other => {
                return Err(Error::upgrade_precondition(
                    400,
                    format!(
                        "upgrade request does not have the expected version: {}",
                        other.unwrap_or_default()
                    ),
                ));
            }
        }

        let key = header_value(headers, SEC_WEBSOCKET_KEY.as_str())
            .ok_or_else(|| Error::upgrade_precondition(400, "upgrade request is missing a key"))?;

        let identity = match &self.authorizer {
            Some(authorizer) => authorizer.authorize(request)?,
            None => None,
        };

        let protocols = offered_protocols(headers);
        // No preference negotiation: the first offered candidate wins.
        let selected_protocol = protocols.first().cloned();

        let accept = derive_accept_key(&key);
        let mut response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(UPGRADE, "websocket")
            .header(CONNECTION, "Upgrade")
            .header(SEC_WEBSOCKET_ACCEPT, accept)
            .header(CONTENT_LENGTH, "0");
        if let Some(protocol) = &selected_protocol {
            response = response.header(SEC_WEBSOCKET_PROTOCOL, protocol.as_str());
        }
        let response = response
            .body(())
            .expect("statically valid switching response");

        let path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| request.uri().path().to_string());

        debug!(%path, ?selected_protocol, "websocket upgrade accepted");
        Ok(Negotiation::Upgraded(ServerUpgrade {
            response,
            path,
            version: SUPPORTED_VERSION,
            protocols,
            selected_protocol,
            identity,
        }))
    }
}

impl std::fmt::Debug for HandshakeNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeNegotiator")
            .field("require_upgrade", &self.require_upgrade)
            .field("authorizer", &self.authorizer.is_some())
            .finish()
    }
}

/// Build the HTTP response for a failed upgrade attempt.
///
/// Uses the status carried by [`Error::UpgradePrecondition`], falling back
/// to 500 for errors that should not surface here.
pub fn rejection_response(error: &Error) -> Response<()> {
    let status = StatusCode::from_u16(error.http_status().unwrap_or(500))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Response::builder()
        .status(status)
        .header(CONTENT_LENGTH, "0")
        .body(())
        .expect("statically valid rejection response")
}

fn upgrade_required_response() -> Response<()> {
    Response::builder()
        .status(StatusCode::UPGRADE_REQUIRED)
        .header(CONTENT_LENGTH, "0")
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "Upgrade")
        .body(())
        .expect("statically valid 426 response")
}

/// Client-side handshake: nonce generation, request construction and
/// accept-value verification.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    key: String,
    protocols: Vec<String>,
}

impl ClientHandshake {
    /// Start a handshake with a freshly generated key
    pub fn new() -> Self {
        Self {
            key: generate_client_key(),
            protocols: Vec::new(),
        }
    }

    /// Offer sub-protocol candidates, in preference order
    pub fn with_protocols(mut self, protocols: Vec<String>) -> Self {
        self.protocols = protocols;
        self
    }

    /// The key this handshake sends as `Sec-WebSocket-Key`
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Build the upgrade request for `host` and `path`
    pub fn request(&self, host: &str, path: &str) -> Request<()> {
        let mut request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .version(Version::HTTP_11)
            .header("Host", host)
            .header(UPGRADE, "websocket")
            .header(CONNECTION, "Upgrade")
            .header(SEC_WEBSOCKET_KEY, self.key.as_str())
            .header(SEC_WEBSOCKET_VERSION, SUPPORTED_VERSION.to_string());
        if !self.protocols.is_empty() {
            request = request.header(SEC_WEBSOCKET_PROTOCOL, self.protocols.join(", "));
        }
        request.body(()).expect("statically valid upgrade request")
    }

    /// Verify the server's 101 response.
    ///
    /// The accept value must equal `derive_accept_key` over the sent key
    /// exactly; a mismatch fails the upgrade with
    /// [`Error::HandshakeMismatch`] (protects against cache poisoning and
    /// proxy corruption).
    pub fn verify(&self, path: &str, response: &Response<()>) -> Result<ClientUpgrade> {
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(Error::upgrade_precondition(
                response.status().as_u16(),
                "server did not switch protocols",
            ));
        }
        let headers = response.headers();
        if !header_value(headers, UPGRADE.as_str())
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
        {
            return Err(Error::upgrade_precondition(
                400,
                "switching response is missing 'Upgrade: websocket'",
            ));
        }

        let received = header_value(headers, SEC_WEBSOCKET_ACCEPT.as_str())
            .ok_or_else(|| Error::upgrade_precondition(400, "missing accept header"))?;
        let expected = derive_accept_key(&self.key);
        if received.trim() != expected {
            return Err(Error::handshake_mismatch(expected, received));
        }

        let selected_protocol = header_value(headers, SEC_WEBSOCKET_PROTOCOL.as_str());
        debug!(%path, ?selected_protocol, "websocket upgrade verified");
        Ok(ClientUpgrade {
            path: path.to_string(),
            version: SUPPORTED_VERSION,
            protocols: self.protocols.clone(),
            selected_protocol,
        })
    }
}

impl Default for ClientHandshake {
    fn default() -> Self {
        Self::new()
    }
}

/// A verified client-side upgrade.
#[derive(Debug, Clone)]
pub struct ClientUpgrade {
    /// Path the connection was opened on
    pub path: String,
    /// Negotiated protocol version
    pub version: u16,
    /// Sub-protocols that were offered
    pub protocols: Vec<String>,
    /// The sub-protocol the server selected, if any
    pub selected_protocol: Option<String>,
}

impl ClientUpgrade {
    /// Context to stamp on every frame decoded on this connection
    pub fn frame_context(&self) -> FrameContext {
        FrameContext::new(self.path.clone(), self.version, self.protocols.clone())
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
}

fn header_has_token(headers: &HeaderMap, name: &str, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}

fn offered_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_request(version: &str, key: Option<&str>) -> Request<()> {
        let mut request = Request::builder()
            .method(Method::GET)
            .uri("/chat")
            .version(Version::HTTP_11)
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_VERSION, version);
        if let Some(key) = key {
            request = request.header(SEC_WEBSOCKET_KEY, key);
        }
        request.body(()).unwrap()
    }

    #[test]
    fn derives_the_rfc_sample_accept_value() {
        assert_eq!(
            derive_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn accepts_a_valid_upgrade() {
        let negotiator = HandshakeNegotiator::new();
        let request = upgrade_request("13", Some("dGhlIHNhbXBsZSBub25jZQ=="));
        let upgrade = match negotiator.negotiate(&request).unwrap() {
            Negotiation::Upgraded(upgrade) => upgrade,
            other => panic!("expected upgrade, got {other:?}"),
        };

        assert_eq!(upgrade.response.status(), StatusCode::SWITCHING_PROTOCOLS);
        let headers = upgrade.response.headers();
        assert_eq!(headers[UPGRADE], "websocket");
        assert_eq!(headers[CONNECTION], "Upgrade");
        assert_eq!(headers[SEC_WEBSOCKET_ACCEPT], "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(headers[CONTENT_LENGTH], "0");
        assert_eq!(upgrade.path, "/chat");
        assert_eq!(upgrade.version, 13);
    }

    #[test]
    fn echoes_the_first_offered_protocol() {
        let negotiator = HandshakeNegotiator::new();
        let request = Request::builder()
            .method(Method::GET)
            .uri("/chat")
            .header(CONNECTION, "keep-alive, Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_VERSION, "13")
            .header(SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .header(SEC_WEBSOCKET_PROTOCOL, "graphql-ws, chat")
            .body(())
            .unwrap();

        let upgrade = match negotiator.negotiate(&request).unwrap() {
            Negotiation::Upgraded(upgrade) => upgrade,
            other => panic!("expected upgrade, got {other:?}"),
        };
        assert_eq!(upgrade.selected_protocol.as_deref(), Some("graphql-ws"));
        assert_eq!(
            upgrade.response.headers()[SEC_WEBSOCKET_PROTOCOL],
            "graphql-ws"
        );
        assert_eq!(upgrade.protocols, vec!["graphql-ws", "chat"]);
    }

    #[test]
    fn unsupported_version_is_rejected_with_400() {
        let negotiator = HandshakeNegotiator::new();
        let request = upgrade_request("8", Some("dGhlIHNhbXBsZSBub25jZQ=="));
        let err = negotiator.negotiate(&request).unwrap_err();
        assert_eq!(err.http_status(), Some(400));
        assert!(!err.is_fatal());
        assert_eq!(rejection_response(&err).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn missing_key_is_rejected_with_400() {
        let negotiator = HandshakeNegotiator::new();
        let request = upgrade_request("13", None);
        let err = negotiator.negotiate(&request).unwrap_err();
        assert_eq!(err.http_status(), Some(400));
    }

    #[test]
    fn non_get_upgrade_attempt_is_rejected() {
        let negotiator = HandshakeNegotiator::new();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/chat")
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .body(())
            .unwrap();
        let err = negotiator.negotiate(&request).unwrap_err();
        assert_eq!(err.http_status(), Some(400));
    }

    #[test]
    fn plain_request_passes_through_or_gets_426() {
        let request = Request::builder()
            .method(Method::GET)
            .uri("/index.html")
            .body(())
            .unwrap();

        let optional = HandshakeNegotiator::new();
        assert!(matches!(
            optional.negotiate(&request).unwrap(),
            Negotiation::NotUpgrade
        ));

        let mandatory = HandshakeNegotiator::new().require_upgrade(true);
        match mandatory.negotiate(&request).unwrap() {
            Negotiation::UpgradeRequired(response) => {
                assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
                assert_eq!(response.headers()[UPGRADE], "websocket");
                assert_eq!(response.headers()[CONNECTION], "Upgrade");
            }
            other => panic!("expected 426, got {other:?}"),
        }
    }

    #[test]
    fn authorizer_identity_is_stamped_on_the_context() {
        struct StaticAuthorizer;
        impl UpgradeAuthorizer for StaticAuthorizer {
            fn authorize(&self, _request: &Request<()>) -> Result<Option<Identity>> {
                Ok(Some(Identity {
                    principal: "alice".to_string(),
                    device: Some("laptop".to_string()),
                }))
            }
        }

        let negotiator = HandshakeNegotiator::new().with_authorizer(Arc::new(StaticAuthorizer));
        let request = upgrade_request("13", Some("dGhlIHNhbXBsZSBub25jZQ=="));
        let upgrade = match negotiator.negotiate(&request).unwrap() {
            Negotiation::Upgraded(upgrade) => upgrade,
            other => panic!("expected upgrade, got {other:?}"),
        };
        let context = upgrade.frame_context();
        assert_eq!(context.principal.as_deref(), Some("alice"));
        assert_eq!(context.device.as_deref(), Some("laptop"));
    }

    #[test]
    fn authorizer_rejection_propagates_its_status() {
        struct DenyAll;
        impl UpgradeAuthorizer for DenyAll {
            fn authorize(&self, _request: &Request<()>) -> Result<Option<Identity>> {
                Err(Error::upgrade_precondition(403, "no websockets for you"))
            }
        }

        let negotiator = HandshakeNegotiator::new().with_authorizer(Arc::new(DenyAll));
        let request = upgrade_request("13", Some("dGhlIHNhbXBsZSBub25jZQ=="));
        let err = negotiator.negotiate(&request).unwrap_err();
        assert_eq!(err.http_status(), Some(403));
        assert_eq!(rejection_response(&err).status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn client_handshake_round_trips_against_the_negotiator() {
        let client = ClientHandshake::new().with_protocols(vec!["chat".to_string()]);
        let request = client.request("example.com:8000", "/chat");
        assert_eq!(request.headers()[SEC_WEBSOCKET_VERSION], "13");

        let negotiator = HandshakeNegotiator::new();
        let upgrade = match negotiator.negotiate(&request).unwrap() {
            Negotiation::Upgraded(upgrade) => upgrade,
            other => panic!("expected upgrade, got {other:?}"),
        };

        let verified = client.verify("/chat", &upgrade.response).unwrap();
        assert_eq!(verified.selected_protocol.as_deref(), Some("chat"));
        assert_eq!(verified.frame_context().path, "/chat");
    }

    #[test]
    fn client_rejects_a_corrupted_accept_value() {
        let client = ClientHandshake::new();
        let response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(UPGRADE, "websocket")
            .header(CONNECTION, "Upgrade")
            .header(SEC_WEBSOCKET_ACCEPT, "bm90IHRoZSByaWdodCBhbnN3ZXI=")
            .body(())
            .unwrap();
        let err = client.verify("/chat", &response).unwrap_err();
        assert!(matches!(err, Error::HandshakeMismatch { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn client_rejects_a_non_switching_response() {
        let client = ClientHandshake::new();
        let response = Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(())
            .unwrap();
        let err = client.verify("/chat", &response).unwrap_err();
        assert_eq!(err.http_status(), Some(400));
    }

    #[test]
    fn generated_keys_are_fresh_and_decodable() {
        let a = generate_client_key();
        let b = generate_client_key();
        assert_ne!(a, b);
        assert_eq!(BASE64_STANDARD.decode(&a).unwrap().len(), 18);
    }
}
