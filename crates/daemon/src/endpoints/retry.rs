// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::time::Duration;

use hvd_common::types::ListenerKind;
use tracing::debug;

use super::error::EndpointError;
use super::listener::{create_listener, BoundListener};
use crate::tls::CertBundle;

pub const BIND_ATTEMPTS: usize = 10;
pub const BIND_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Run `op` until it succeeds, fails for good, or runs out of attempts.
pub(crate) async fn retry_transient<T, F, Fut>(mut op: F) -> Result<T, EndpointError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EndpointError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < BIND_ATTEMPTS => {
                debug!(attempt, "Retrying after transient failure: {e}");
                attempt += 1;
                tokio::time::sleep(BIND_RETRY_DELAY).await;
            }
            result => return result,
        }
    }
}

/// # Errors
/// Returns the last bind error once retries are exhausted, or the first
/// non-transient one
pub async fn bind_with_retry(
    kind: ListenerKind,
    address: &str,
    cert: &CertBundle,
) -> Result<BoundListener, EndpointError> {
    retry_transient(|| create_listener(kind, address, cert)).await
}
