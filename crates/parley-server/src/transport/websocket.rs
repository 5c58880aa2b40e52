//! WebSocket upgrade using tokio-tungstenite.
//!
//! Accepts `GET /ws?uid=<id>` and hands back the upgraded stream together
//! with the claimed client id. Anything else is refused during the HTTP
//! handshake, before a WebSocket exists.

use crate::connection::Transport;
use parley_core::protocol::{UID_PARAM, WS_PATH};
use parley_core::{ClientId, ParleyError, ParleyResult};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::debug;

/// A handle to an accepted WebSocket connection.
pub struct UpgradedConnection {
    pub client_id: ClientId,
    pub ws_stream: Transport,
    pub remote_addr: SocketAddr,
}

/// Why an upgrade request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NotFound,
    MissingUid,
    AtCapacity,
}

impl Rejection {
    pub fn status(self) -> StatusCode {
        match self {
            Rejection::NotFound => StatusCode::NOT_FOUND,
            Rejection::MissingUid => StatusCode::BAD_REQUEST,
            Rejection::AtCapacity => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Rejection::NotFound => "Not found",
            Rejection::MissingUid => "Missing uid",
            Rejection::AtCapacity => "Too many connections",
        }
    }

    fn into_response(self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.message().to_string()));
        *response.status_mut() = self.status();
        response
    }
}

/// Frame limits applied to every accepted socket.
pub fn ws_config(max_frame_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_frame_size);
    config.max_frame_size = Some(max_frame_size);
    config
}

/// Extract the claimed client id from the upgrade request target.
pub fn client_id_from_uri(uri: &Uri) -> Result<ClientId, Rejection> {
    if uri.path() != WS_PATH {
        return Err(Rejection::NotFound);
    }
    let uid = uri.query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == UID_PARAM)
            .map(|(_, value)| value.into_owned())
    });
    uid.and_then(|uid| ClientId::new(uid).ok())
        .ok_or(Rejection::MissingUid)
}

/// Run the HTTP upgrade on an accepted TCP stream.
///
/// `admit = false` refuses the request with 503 (the connection cap is
/// reached) while still answering it properly.
pub async fn accept(
    stream: TcpStream,
    remote_addr: SocketAddr,
    max_frame_size: usize,
    admit: bool,
) -> ParleyResult<UpgradedConnection> {
    let mut claimed: Option<ClientId> = None;
    let mut rejected: Option<Rejection> = None;

    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let outcome = if admit {
            client_id_from_uri(request.uri())
        } else {
            Err(Rejection::AtCapacity)
        };
        match outcome {
            Ok(client_id) => {
                debug!(remote = %remote_addr, client_id = %client_id, "upgrade accepted");
                claimed = Some(client_id);
                Ok(response)
            }
            Err(rejection) => {
                rejected = Some(rejection);
                Err(rejection.into_response())
            }
        }
    };

    let result = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        callback,
        Some(ws_config(max_frame_size)),
    )
    .await;

    let ws_stream = match (result, rejected) {
        (Ok(ws_stream), _) => ws_stream,
        (Err(_), Some(rejection)) => {
            return Err(ParleyError::Handshake(format!(
                "{} ({})",
                rejection.message(),
                rejection.status()
            )));
        }
        (Err(e), None) => {
            return Err(ParleyError::Handshake(format!("WebSocket handshake failed: {e}")));
        }
    };

    let client_id = claimed
        .ok_or_else(|| ParleyError::Handshake("upgrade completed without a client id".into()))?;

    Ok(UpgradedConnection {
        client_id,
        ws_stream,
        remote_addr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn extracts_uid() {
        let id = client_id_from_uri(&uri("/ws?uid=alice")).unwrap();
        assert_eq!(id.as_str(), "alice");
    }

    #[test]
    fn uid_is_percent_decoded() {
        let id = client_id_from_uri(&uri("/ws?foo=1&uid=bob%40example.com")).unwrap();
        assert_eq!(id.as_str(), "bob@example.com");
    }

    #[test]
    fn first_uid_wins() {
        let id = client_id_from_uri(&uri("/ws?uid=alice&uid=mallory")).unwrap();
        assert_eq!(id.as_str(), "alice");
    }

    #[test]
    fn missing_or_empty_uid() {
        assert_eq!(client_id_from_uri(&uri("/ws")), Err(Rejection::MissingUid));
        assert_eq!(client_id_from_uri(&uri("/ws?uid=")), Err(Rejection::MissingUid));
        assert_eq!(client_id_from_uri(&uri("/ws?user=alice")), Err(Rejection::MissingUid));
    }

    #[test]
    fn wrong_path() {
        assert_eq!(client_id_from_uri(&uri("/chat?uid=alice")), Err(Rejection::NotFound));
    }

    #[test]
    fn rejection_statuses() {
        assert_eq!(Rejection::MissingUid.status(), StatusCode::BAD_REQUEST);
        assert_eq!(Rejection::AtCapacity.status(), StatusCode::SERVICE_UNAVAILABLE);
        let response = Rejection::MissingUid.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.body().as_deref(), Some("Missing uid"));
    }
}
