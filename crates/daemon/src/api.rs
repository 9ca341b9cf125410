// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Built-in request handlers for each listener kind.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{middleware, Extension, Json, Router};
use hvd_common::types::{AddressUpdate, EndpointInfo, ListenerKind, Transport};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use tracing::info;

use crate::endpoints::{ConnectionInfo, EndpointError, Endpoints};
use crate::utils::auth::require_peer_address;

/// Reply to `GET /` on every endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub kind: ListenerKind,
    pub trusted: bool,
    pub peer: Option<String>,
}

pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

impl From<EndpointError> for ApiError {
    fn from(err: EndpointError) -> Self {
        let status = match err {
            EndpointError::Config(_) | EndpointError::InvalidAddress { .. } => {
                StatusCode::BAD_REQUEST
            }
            EndpointError::InvalidState { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self(status, err.to_string())
    }
}

async fn hello(Extension(conn): Extension<ConnectionInfo>) -> Json<Hello> {
    Json(Hello {
        kind: conn.kind,
        trusted: conn.peer.is_some() || conn.kind.transport() == Transport::Unix,
        peer: conn.peer.and_then(|p| p.hostname().map(str::to_owned)),
    })
}

async fn list_endpoints(State(endpoints): State<Arc<Endpoints>>) -> Json<Vec<EndpointInfo>> {
    Json(endpoints.addresses().await)
}

async fn set_address(
    State(endpoints): State<Arc<Endpoints>>,
    Path(kind): Path<ListenerKind>,
    Json(update): Json<AddressUpdate>,
) -> Result<StatusCode, ApiError> {
    info!(%kind, address = %update.address, "Address change requested");
    endpoints.update_address(kind, &update.address).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /` only.
pub fn kind_router() -> Router {
    Router::new().route("/", get(hello))
}

/// Endpoint listing and reconfiguration, for the admin kinds.
pub fn admin_router(endpoints: Arc<Endpoints>) -> Router {
    Router::new()
        .route("/", get(hello))
        .route("/1.0/endpoints", get(list_endpoints))
        .route("/1.0/endpoints/{kind}", put(set_address))
        .with_state(endpoints)
}

/// Peers must connect from an address listed in their certificate.
pub fn cluster_router() -> Router {
    kind_router().layer(middleware::from_fn(require_peer_address))
}

/// Handlers for every kind except the guest agent, which is opt-in.
pub fn default_servers(endpoints: &Arc<Endpoints>) -> HashMap<ListenerKind, Router> {
    ListenerKind::iter()
        .filter_map(|kind| {
            let router = match kind {
                ListenerKind::LocalAdmin | ListenerKind::NetworkAdmin => {
                    admin_router(endpoints.clone())
                }
                ListenerKind::Cluster => cluster_router(),
                ListenerKind::Metrics | ListenerKind::StorageObjects | ListenerKind::VmConsole => {
                    kind_router()
                }
                ListenerKind::GuestAgent => return None,
            };
            Some((kind, router))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn local() -> ConnectionInfo {
        ConnectionInfo {
            kind: ListenerKind::LocalAdmin,
            remote: "unix".to_owned(),
            remote_ip: None,
            peer: None,
        }
    }

    #[tokio::test]
    async fn test_hello_reports_kind() -> anyhow::Result<()> {
        let mut req = Request::get("/").body(Body::empty())?;
        req.extensions_mut().insert(local());
        let resp = kind_router().oneshot(req).await?;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await?.to_bytes();
        let hello: Hello = serde_json::from_slice(&body)?;
        assert_eq!(
            hello,
            Hello {
                kind: ListenerKind::LocalAdmin,
                trusted: true,
                peer: None
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_update_on_unstarted_is_conflict() -> anyhow::Result<()> {
        let endpoints = Arc::new(Endpoints::unstarted());
        let req = Request::put("/1.0/endpoints/metrics")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"address": "127.0.0.1:9100"}"#))?;
        let resp = admin_router(endpoints.clone()).oneshot(req).await?;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let req = Request::put("/1.0/endpoints/local-admin")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"address": "/tmp/other.socket"}"#))?;
        let resp = admin_router(endpoints).oneshot(req).await?;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[test]
    fn test_default_servers() {
        let servers = default_servers(&Arc::new(Endpoints::unstarted()));
        assert_eq!(servers.len(), 6);
        assert!(!servers.contains_key(&ListenerKind::GuestAgent));
    }
}
