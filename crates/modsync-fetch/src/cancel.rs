use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Race `fut` against `cancel`; the future is dropped (and any in-flight
/// request with it) as soon as the token fires.
pub async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        out = fut => Ok(out),
    }
}
