//! Bandwidth throttle gating retrieved bytes on signed allocations.
//!
//! The allocation receiver produces budget as countersigned totals arrive;
//! the data sender consumes it before each chunk. `fail` wires an error into
//! both sides: a consume after fail always observes the error.

use parking_lot::Mutex;
use tokio::sync::Notify;

use orbit_proto::ErrorKind;

/// Error installed into a failed throttle.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ThrottleError {
    /// Classification for the wire.
    pub kind: ErrorKind,
    /// Details.
    pub message: String,
}

impl ThrottleError {
    /// Creates a throttle error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    available: i64,
    failed: Option<ThrottleError>,
}

/// Producer/consumer byte budget.
#[derive(Debug, Default)]
pub struct Throttle {
    state: Mutex<State>,
    notify: Notify,
}

impl Throttle {
    /// Creates an empty throttle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `amount` bytes of budget and wakes any waiting consumer.
    pub fn produce(&self, amount: i64) -> Result<(), ThrottleError> {
        {
            let mut state = self.state.lock();
            if let Some(err) = &state.failed {
                return Err(err.clone());
            }
            state.available += amount;
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Takes up to `max` bytes of budget, waiting until some is available.
    pub async fn consume_or_wait(&self, max: i64) -> Result<i64, ThrottleError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(err) = &state.failed {
                    return Err(err.clone());
                }
                if state.available > 0 {
                    let taken = state.available.min(max);
                    state.available -= taken;
                    return Ok(taken);
                }
            }

            notified.await;
        }
    }

    /// Installs `err` and unblocks both sides.
    pub fn fail(&self, err: ThrottleError) {
        {
            let mut state = self.state.lock();
            if state.failed.is_none() {
                state.failed = Some(err);
            }
        }
        self.notify.notify_waiters();
    }

    /// Returns the installed error, if any.
    pub fn err(&self) -> Option<ThrottleError> {
        self.state.lock().failed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_consume_caps_at_available() {
        let throttle = Throttle::new();
        throttle.produce(10).unwrap();

        assert_eq!(throttle.consume_or_wait(4).await.unwrap(), 4);
        assert_eq!(throttle.consume_or_wait(100).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_consume_waits_for_produce() {
        let throttle = Arc::new(Throttle::new());

        let consumer = {
            let throttle = throttle.clone();
            tokio::spawn(async move { throttle.consume_or_wait(8).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        throttle.produce(3).unwrap();
        assert_eq!(consumer.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_fail_unblocks_waiting_consumer() {
        let throttle = Arc::new(Throttle::new());

        let consumer = {
            let throttle = throttle.clone();
            tokio::spawn(async move { throttle.consume_or_wait(8).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        throttle.fail(ThrottleError::new(ErrorKind::Integrity, "bad allocation"));

        let err = consumer.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Integrity);
    }

    #[tokio::test]
    async fn test_consume_after_fail_returns_error() {
        let throttle = Throttle::new();
        throttle.produce(100).unwrap();
        throttle.fail(ThrottleError::new(ErrorKind::Canceled, "peer gone"));

        // Budget remains, but the failure wins.
        let err = throttle.consume_or_wait(10).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Canceled);

        let err = throttle.produce(10).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Canceled);
    }

    #[tokio::test]
    async fn test_first_failure_sticks() {
        let throttle = Throttle::new();
        throttle.fail(ThrottleError::new(ErrorKind::Integrity, "first"));
        throttle.fail(ThrottleError::new(ErrorKind::Internal, "second"));
        assert_eq!(throttle.err().unwrap().message, "first");
    }
}
