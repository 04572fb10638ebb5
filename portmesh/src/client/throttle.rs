//! Rate-limiting wrapper around `send` for high-frequency messages.

use crate::client::PeerClient;
use crate::protocol::Target;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

/// Coalesces a high-frequency outbound message to at most one send per
/// interval, keeping only the latest arguments.
///
/// # Edge policy (public contract)
///
/// Trailing-edge: the first call in a quiet period opens an interval
/// window and arms a timer; every further call inside the window replaces
/// the retained arguments. When the window elapses, exactly one send fires
/// with the arguments of the last call observed, so N calls inside one
/// interval produce exactly one send carrying the Nth call's arguments.
///
/// Sends are fire-and-forget from the caller's point of view; a failing
/// underlying send is reported on the client's error channel.
pub struct ThrottledSender {
    inner: Rc<ThrottleInner>,
}

struct ThrottleInner {
    client: PeerClient,
    target: Target,
    name: String,
    interval: Duration,
    state: RefCell<ThrottleState>,
}

struct ThrottleState {
    /// Latest arguments observed in the open window, if any.
    retained: Option<Vec<Value>>,
    /// Whether a trailing timer is armed.
    armed: bool,
}

impl ThrottledSender {
    pub(crate) fn new(
        client: PeerClient,
        target: Target,
        name: String,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Rc::new(ThrottleInner {
                client,
                target,
                name,
                interval,
                state: RefCell::new(ThrottleState {
                    retained: None,
                    armed: false,
                }),
            }),
        }
    }

    /// Record a call. The latest arguments within the current interval win.
    pub fn call(&self, args: Vec<Value>) {
        let mut state = self.inner.state.borrow_mut();
        state.retained = Some(args);
        if state.armed {
            return;
        }
        state.armed = true;
        drop(state);

        let inner = Rc::clone(&self.inner);
        let _ = tokio::task::spawn_local(async move {
            tokio::time::sleep(inner.interval).await;
            let retained = {
                let mut state = inner.state.borrow_mut();
                state.armed = false;
                state.retained.take()
            };
            if let Some(args) = retained {
                if let Err(error) = inner
                    .client
                    .send(&inner.target, &inner.name, args)
                    .await
                {
                    inner.client.report_error(error);
                }
            }
        });
    }
}
