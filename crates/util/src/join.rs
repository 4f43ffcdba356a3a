use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// A service that is awaited on shutdown.
///
/// `join` resolves once the service has fully stopped, forcing it down if
/// the deadline passes first. The output is `None` when the service did not
/// finish cleanly (panicked, was aborted, or overran the deadline).
pub trait Joinable {
    type Output;

    fn join(&mut self, deadline: Duration) -> impl Future<Output = Option<Self::Output>> + Send;
}

impl<T: Send + 'static> Joinable for JoinHandle<T> {
    type Output = T;

    async fn join(&mut self, deadline: Duration) -> Option<T> {
        match tokio::time::timeout(deadline, &mut *self).await {
            Ok(Ok(output)) => Some(output),
            Ok(Err(_)) => None,
            Err(_) => {
                self.abort();
                None
            }
        }
    }
}
