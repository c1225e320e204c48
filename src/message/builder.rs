use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{ mpsc, oneshot, Mutex };
use tracing::{ debug, info, trace };

use super::build::{ build_rfc822, BuildError };
use super::header::JobOptions;
use crate::store::{ Attachment, Client, Message };
use crate::utils::panic;
use crate::utils::parallel::run_parallel;

type BuildResult = Result<Vec<u8>, BuildError>;

struct FetchRequest {
    client: Arc<dyn Client>,
    message_id: String,
    opts: JobOptions,
    respond: oneshot::Sender<BuildResult>,
}

struct BuildRequest {
    client: Arc<dyn Client>,
    message: Message,
    attachments: HashMap<String, Vec<u8>>,
    opts: JobOptions,
    respond: oneshot::Sender<BuildResult>,
}

/// Front of the two-stage pipeline: fetch workers download ciphertext and
/// hand it to build workers, which decrypt and assemble the literal.
#[derive(Clone)]
pub struct Builder {
    requests: mpsc::Sender<FetchRequest>,
}

impl Builder {
    pub fn new(fetch_workers: usize, build_workers: usize, attachment_workers: usize) -> Self {
        let (requests, fetch_rx) = mpsc::channel::<FetchRequest>(1);
        let (builds, build_rx) = mpsc::channel::<BuildRequest>(1);
        let fetch_rx = Arc::new(Mutex::new(fetch_rx));
        let build_rx = Arc::new(Mutex::new(build_rx));
        let attachment_workers = attachment_workers.max(1);

        for _ in 0..fetch_workers.max(1) {
            panic::spawn("fetch worker", fetch_worker(fetch_rx.clone(), builds.clone(), attachment_workers));
        }
        for _ in 0..build_workers.max(1) {
            panic::spawn("build worker", build_worker(build_rx.clone()));
        }

        info!(fetch_workers, build_workers, attachment_workers, "Message build pipeline started");
        Self { requests }
    }

    /// Fetches, decrypts and assembles one message.
    pub async fn build(&self, client: Arc<dyn Client>, message_id: &str, opts: JobOptions) -> BuildResult {
        let (respond, result) = oneshot::channel();
        let request = FetchRequest { client, message_id: message_id.to_string(), opts, respond };

        self.requests.send(request).await.map_err(|_| BuildError::PipelineClosed)?;
        result.await.map_err(|_| BuildError::PipelineClosed)?
    }
}

async fn fetch_worker(
    requests: Arc<Mutex<mpsc::Receiver<FetchRequest>>>,
    builds: mpsc::Sender<BuildRequest>,
    attachment_workers: usize
) {
    loop {
        let next = requests.lock().await.recv().await;
        let Some(FetchRequest { client, message_id, opts, respond }) = next else {
            break;
        };

        trace!(msg_id = %message_id, "Fetching message");
        let fetched = panic::recover(
            "message fetch",
            fetch_message(client.clone(), &message_id, attachment_workers)
        ).await;

        match fetched {
            Ok((message, attachments)) => {
                let request = BuildRequest { client, message, attachments, opts, respond };
                if builds.send(request).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(msg_id = %message_id, error = %err, "Message fetch failed");
                let _ = respond.send(Err(BuildError::Store(err)));
            }
        }
    }
}

async fn fetch_message(
    client: Arc<dyn Client>,
    message_id: &str,
    attachment_workers: usize
) -> anyhow::Result<(Message, HashMap<String, Vec<u8>>)> {
    let message = client.get_message(message_id).await?;

    let mut data = HashMap::with_capacity(message.attachments.len());
    run_parallel(
        attachment_workers,
        message.attachments.clone(),
        move |attachment: Attachment| {
            let client = client.clone();
            async move {
                let bytes = client
                    .get_attachment(&attachment.id).await
                    .with_context(|| format!("cannot download attachment {}", attachment.id))?;
                Ok((attachment.id, bytes))
            }
        },
        |_, (id, bytes)| {
            data.insert(id, bytes);
            Ok(())
        }
    ).await?;

    Ok((message, data))
}

async fn build_worker(requests: Arc<Mutex<mpsc::Receiver<BuildRequest>>>) {
    loop {
        let next = requests.lock().await.recv().await;
        let Some(request) = next else {
            break;
        };

        let BuildRequest { client, message, attachments, opts, respond } = request;
        let built = panic::recover("message build", async {
            let key_ring = match client.key_ring_for_address(&message.address_id).await {
                Ok(key_ring) => key_ring,
                Err(err) => {
                    return Ok(Err(BuildError::Store(err)));
                }
            };
            Ok(build_rfc822(key_ring.as_ref(), &message, &attachments, &opts))
        }).await;

        let result = built.unwrap_or_else(|err| Err(BuildError::Store(err)));
        if let Err(err) = &result {
            debug!(msg_id = %message.id, error = %err, "Message build failed");
        }
        let _ = respond.send(result);
    }
}
