//! Cooperative cancellation shared by every network and subprocess wait.

use std::future::Future;

use tokio_util::sync::CancellationToken;

/// Races `future` against `token`, mapping cancellation through `on_cancel`.
///
/// Cancellation wins ties so a token that is already cancelled never starts
/// new work.
///
/// # Errors
///
/// Returns the future's own error, or `on_cancel()` once the token fires.
pub async fn cancellable<F, T, E>(
    token: &CancellationToken,
    future: F,
    on_cancel: impl FnOnce() -> E,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    tokio::select! {
        biased;
        () = token.cancelled() => Err(on_cancel()),
        result = future => result,
    }
}
