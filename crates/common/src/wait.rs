use std::time::{Duration, Instant};

/// Poll `connect` until it succeeds or `timeout` elapses.
///
/// With `timeout == None` this waits forever. The last connection error is
/// included in the timeout error.
pub fn wait_for_resource<F, T, E>(
    mut connect: F,
    poll_interval: Duration,
    timeout: Option<Duration>,
    resource_name: &str,
) -> anyhow::Result<T>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    loop {
        match connect() {
            Ok(resource) => {
                tracing::info!(resource = resource_name, "Resource available");
                return Ok(resource);
            }
            Err(e) => {
                if let Some(timeout) = timeout
                    && started.elapsed() >= timeout
                {
                    anyhow::bail!(
                        "{} not available after {:?}: {}",
                        resource_name,
                        timeout,
                        e
                    );
                }
                tracing::debug!(resource = resource_name, error = %e, "Waiting for resource");
                std::thread::sleep(poll_interval);
            }
        }
    }
}
