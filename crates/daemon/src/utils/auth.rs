// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;

use super::x509::SecurityInfo;
use crate::endpoints::ConnectionInfo;

type Rejection = (StatusCode, String);

fn security_info(req: &Request) -> Result<(&SecurityInfo, &ConnectionInfo), Rejection> {
    let conn = req
        .extensions()
        .get::<ConnectionInfo>()
        .ok_or((StatusCode::UNAUTHORIZED, "Unknown connection".to_owned()))?;
    let info = conn
        .peer
        .as_ref()
        .ok_or((StatusCode::UNAUTHORIZED, "No valid certificate".to_owned()))?;
    Ok((info, conn))
}

/// # Errors
/// Rejects the request if the peer IP is not listed in its certificate
pub async fn require_peer_address(req: Request, next: Next) -> Result<Response, Rejection> {
    check_peer_address(&req)?;
    Ok(next.run(req).await)
}

fn check_peer_address(req: &Request) -> Result<(), Rejection> {
    let (info, conn) = security_info(req)?;
    let Some(ip) = conn.remote_ip else {
        return Err((
            StatusCode::UNAUTHORIZED,
            "Can't determine IP address".to_owned(),
        ));
    };
    if info.check_address(&ip) {
        Ok(())
    } else {
        Err((
            StatusCode::FORBIDDEN,
            format!("Address {ip} mismatched with address in certificate"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use hvd_common::types::ListenerKind;
    use tower::ServiceExt;

    const CLIENT_CERT: &[u8] = include_bytes!("../../tests/fixtures/client.crt");

    fn peer() -> anyhow::Result<SecurityInfo> {
        let der = rustls_pemfile::certs(&mut &*CLIENT_CERT)
            .next()
            .ok_or_else(|| anyhow::anyhow!("fixture has no certificate"))??;
        Ok(SecurityInfo::try_from(der.as_ref())?)
    }

    async fn status(conn: Option<ConnectionInfo>) -> anyhow::Result<StatusCode> {
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn(require_peer_address));
        let mut req = axum::http::Request::get("/").body(Body::empty())?;
        if let Some(conn) = conn {
            req.extensions_mut().insert(conn);
        }
        Ok(app.oneshot(req).await?.status())
    }

    #[tokio::test]
    async fn test_peer_address_checked() -> anyhow::Result<()> {
        let conn = |ip: &str, peer: Option<SecurityInfo>| -> anyhow::Result<ConnectionInfo> {
            Ok(ConnectionInfo {
                kind: ListenerKind::Cluster,
                remote: format!("{ip}:40000"),
                remote_ip: Some(ip.parse()?),
                peer,
            })
        };
        assert_eq!(status(Some(conn("127.0.0.1", Some(peer()?))?)).await?, StatusCode::OK);
        assert_eq!(
            status(Some(conn("10.1.1.1", Some(peer()?))?)).await?,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status(Some(conn("127.0.0.1", None)?)).await?,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(status(None).await?, StatusCode::UNAUTHORIZED);
        Ok(())
    }
}
