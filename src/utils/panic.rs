use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use anyhow::{ anyhow, Result };
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::error;

/// Awaits `fut`, turning a panic inside it into an error after writing a
/// crash report to the log.
pub async fn recover<F, T>(context: &str, fut: F) -> Result<T> where F: Future<Output = Result<T>> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            report(context, payload.as_ref());
            Err(anyhow!("internal error while handling {}", context))
        }
    }
}

/// Spawns a background task whose panics are reported instead of silently
/// ending the task.
pub fn spawn<F>(context: &'static str, fut: F) -> JoinHandle<()>
    where F: Future<Output = ()> + Send + 'static
{
    tokio::spawn(async move {
        if let Err(payload) = AssertUnwindSafe(fut).catch_unwind().await {
            report(context, payload.as_ref());
        }
    })
}

fn report(context: &str, payload: &(dyn Any + Send)) {
    let reason = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());

    error!(context, reason = %reason, "Crash report: recovered from panic");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recover_passes_results_through() {
        let ok = recover("ok", async { Ok::<_, anyhow::Error>(7) }).await.unwrap();
        assert_eq!(ok, 7);

        let err = recover("err", async { Err::<u8, _>(anyhow!("boom")) }).await;
        assert_eq!(err.unwrap_err().to_string(), "boom");
    }

    #[tokio::test]
    async fn test_recover_catches_panic() {
        let result: Result<u8> = recover("FETCH", async {
            let depth: Vec<u8> = Vec::new();
            Ok(depth[3])
        }).await;
        assert!(result.unwrap_err().to_string().contains("FETCH"));
    }

    #[tokio::test]
    async fn test_spawn_survives_panic() {
        let handle = spawn("worker", async {
            panic!("worker died");
        });
        assert!(handle.await.is_ok());
    }
}
