/// Time-limited calls.
///
/// The call runs on its own task; when the limit fires the caller gets
/// [`DaemonError::Timeout`] while the call itself is left to finish.
use crate::errors::{DaemonError, DaemonResult};
use std::future::Future;
use std::time::Duration;

pub async fn call_with_timeout<T, E, F>(limit: Duration, call: F) -> DaemonResult<T>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Into<DaemonError> + Send + 'static,
{
    let handle = tokio::spawn(call);
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(result)) => result.map_err(Into::into),
        Ok(Err(join_error)) => Err(DaemonError::Other(format!(
            "Time-limited call failed: {}",
            join_error
        ))),
        Err(_) => Err(DaemonError::Timeout),
    }
}
