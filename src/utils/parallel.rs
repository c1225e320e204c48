use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };

use anyhow::{ anyhow, Result };
use tokio::sync::{ mpsc, Mutex };
use tracing::trace;

use super::panic;

/// Runs `process` over every item of `input` on at most `workers` concurrent
/// tasks and hands each result to `collect` strictly in input order.
///
/// The first error, from either side, stops the run: no further items are
/// started, outstanding tasks are aborted and the error is returned. When
/// item `k` fails, `collect` has seen at most the indices below `k`.
pub async fn run_parallel<T, R, P, Fut, C>(
    workers: usize,
    input: Vec<T>,
    process: P,
    mut collect: C
) -> Result<()>
    where
        T: Send + 'static,
        R: Send + 'static,
        P: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        C: FnMut(usize, R) -> Result<()>
{
    let total = input.len();
    if total == 0 {
        return Ok(());
    }

    let workers = workers.clamp(1, total);
    trace!(workers, total, "Starting parallel run");

    let queue = Arc::new(Mutex::new(input.into_iter().enumerate()));
    let stopped = Arc::new(AtomicBool::new(false));
    let process = Arc::new(process);
    let (tx, mut rx) = mpsc::channel::<(usize, Result<R>)>(workers);

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let queue = queue.clone();
        let stopped = stopped.clone();
        let process = process.clone();
        let tx = tx.clone();

        handles.push(
            panic::spawn("parallel worker", async move {
                while !stopped.load(Ordering::Relaxed) {
                    let next = queue.lock().await.next();
                    let Some((index, item)) = next else {
                        break;
                    };

                    let result = panic::recover("parallel item", process(item)).await;
                    if tx.send((index, result)).await.is_err() {
                        break;
                    }
                }
            })
        );
    }
    drop(tx);

    // Results arrive in completion order; hold the early ones back.
    let mut pending: HashMap<usize, R> = HashMap::new();
    let mut next = 0;

    let outcome = loop {
        if next == total {
            break Ok(());
        }

        if let Some(value) = pending.remove(&next) {
            if let Err(e) = collect(next, value) {
                break Err(e);
            }
            next += 1;
            continue;
        }

        match rx.recv().await {
            Some((index, Ok(value))) => {
                pending.insert(index, value);
            }
            Some((index, Err(e))) => {
                trace!(index, "Parallel item failed");
                break Err(e);
            }
            None => {
                break Err(anyhow!("parallel workers exited with {} of {} results collected", next, total));
            }
        }
    };

    if outcome.is_err() {
        stopped.store(true, Ordering::Relaxed);
        for handle in &handles {
            handle.abort();
        }
    }

    outcome
}
