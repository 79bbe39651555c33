//! Deadline-bounded readiness waits
//!
//! [`wait_for`] consumes the change events of a watched resource until a
//! predicate accepts one, the predicate reports a hard error, or the deadline
//! elapses. The subscription is owned by the wait and released on every exit
//! path.

use std::time::Duration;

use futures::StreamExt;
use tracing::{trace, warn};

use crate::api::{ResourceApi, Selector, WatchEvent};
use crate::Result;

/// Wait until `predicate` accepts an event for the selected objects.
///
/// Returns `Ok(true)` when the predicate accepts an event, `Ok(false)` when
/// the deadline elapses or the event stream ends first, and `Err` when the
/// predicate reports a hard failure. Callers turn `Ok(false)` into a
/// descriptive timeout error.
///
/// Stream-level errors are logged and skipped; the deadline still bounds the
/// wait.
pub async fn wait_for<K, F>(
    api: &dyn ResourceApi<K>,
    selector: &Selector,
    deadline: Duration,
    mut predicate: F,
) -> Result<bool>
where
    K: Send + Sync + 'static,
    F: FnMut(&WatchEvent<K>) -> Result<bool>,
{
    let expires_at = tokio::time::Instant::now() + deadline;
    let mut events = api.watch(selector, deadline);

    loop {
        let next = match tokio::time::timeout_at(expires_at, events.next()).await {
            Ok(next) => next,
            Err(_) => {
                trace!(?selector, ?deadline, "readiness deadline elapsed");
                return Ok(false);
            }
        };

        match next {
            None => {
                trace!(?selector, "watch stream ended before readiness");
                return Ok(false);
            }
            Some(Err(e)) => {
                warn!(?selector, error = %e, "watch error, continuing until deadline");
            }
            Some(Ok(event)) => {
                if predicate(&event)? {
                    return Ok(true);
                }
            }
        }
    }
}
