//! Cooperative cancellation for step phases.

use std::sync::Arc;
use tokio::sync::watch;

/// A cloneable cancellation signal shared between a caller and the phases
/// it drives.
///
/// Long-running delegated actions race their work against
/// [`CancellationToken::cancelled`] instead of polling.
///
/// ```
/// use kumitate_core::CancellationToken;
///
/// let token = CancellationToken::new();
/// let child = token.clone();
/// assert!(!child.is_cancelled());
/// token.cancel();
/// assert!(child.is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct CancellationToken {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Signals cancellation to every clone of this token.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Completes once the token is cancelled. Never completes otherwise.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so `wait_for` only returns
        // once the flag flips.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}
