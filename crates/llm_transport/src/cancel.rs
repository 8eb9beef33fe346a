use std::future::Future;
use std::sync::{atomic::AtomicBool, atomic::Ordering, Arc};
use std::time::Duration;

use crate::error::TransportError;

/// Optional cancellation signal shared across request and stream loops.
pub type CancelSignal = Arc<AtomicBool>;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

pub fn is_cancelled(cancel: Option<&CancelSignal>) -> bool {
    cancel.is_some_and(|token| token.load(Ordering::Acquire))
}

/// Fails with [`TransportError::Cancelled`] when the signal has fired.
pub fn check_cancelled(cancel: Option<&CancelSignal>) -> Result<(), TransportError> {
    if is_cancelled(cancel) {
        Err(TransportError::Cancelled)
    } else {
        Ok(())
    }
}

/// Drives `future` while polling the signal, so a fired signal interrupts a stalled await.
pub async fn await_or_cancel<F>(
    future: F,
    cancel: Option<&CancelSignal>,
) -> Result<F::Output, TransportError>
where
    F: Future,
{
    if cancel.is_none() {
        return Ok(future.await);
    }

    let mut future = Box::pin(future);

    loop {
        check_cancelled(cancel)?;

        if let Ok(output) = tokio::time::timeout(CANCEL_POLL_INTERVAL, &mut future).await {
            check_cancelled(cancel)?;
            return Ok(output);
        }
    }
}

/// Sleeps for `delay` unless cancelled first.
pub async fn sleep_or_cancel(
    delay: Duration,
    cancel: Option<&CancelSignal>,
) -> Result<(), TransportError> {
    await_or_cancel(tokio::time::sleep(delay), cancel).await
}
