//! Retry for transient SOAP failures.

use std::time::Duration;

use super::soap::{SoapError, SoapResult};

/// Backoff between attempts.
const RETRY_DELAYS_MS: [u64; 3] = [200, 500, 1000];

/// Runs a SOAP operation, retrying transient faults and timeouts.
///
/// Non-transient errors return immediately.
///
/// # Arguments
/// * `action` - Action name for logging
/// * `operation` - Closure that performs the request
pub(crate) async fn with_retry<T, F, Fut>(action: &str, mut operation: F) -> SoapResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = SoapResult<T>>,
{
    let mut last_error: Option<SoapError> = None;
    for (attempt, &delay_ms) in std::iter::once(&0)
        .chain(RETRY_DELAYS_MS.iter())
        .enumerate()
    {
        if attempt > 0 {
            log::info!(
                "[SOAP] Retrying {} (attempt {}/{}) after {}ms",
                action,
                attempt + 1,
                RETRY_DELAYS_MS.len() + 1,
                delay_ms
            );
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        match operation().await {
            Ok(r) => return Ok(r),
            Err(e) if e.is_transient() => {
                log::warn!("[SOAP] {} transient error: {}", action, e);
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or(SoapError::Parse))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upnp::soap::SoapFault;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn transition_fault() -> SoapError {
        SoapError::Fault(SoapFault {
            code: Some(701),
            description: "Transition not available".into(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_faults_until_success() {
        let calls = AtomicUsize::new(0);
        let result = with_retry("Play", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(transition_fault())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_all_delays() {
        let calls = AtomicUsize::new(0);
        let result: SoapResult<()> = with_retry("Play", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transition_fault()) }
        })
        .await;
        assert!(matches!(result, Err(SoapError::Fault(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: SoapResult<()> = with_retry("Play", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SoapError::Parse) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
