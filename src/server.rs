use crate::category::Route;
use crate::pipeline::{JobOutcome, Pipeline};
use crate::queue::WorkQueue;
use crate::store::JobStore;
use crate::worker::{self, Dispatch, WorkMessage};
use crate::Status;
use anyhow::Error;
use async_channel::Sender;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Pause after a failed queue or store call before trying again.
const RETRY_DELAY: Duration = Duration::from_secs(5);

pub async fn serve(
    cancel_token: CancellationToken,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    pipeline: Pipeline,
    workers_count: u16,
    requeue_processing: bool,
) -> Result<(), Error> {
    let workers_count = workers_count.max(1);
    let (send_to_server, mut recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();
    let (send_to_queue, recv_from_queue) = async_channel::bounded::<Dispatch>(workers_count as usize);

    let mut workers = vec![];
    for _ in 0..workers_count {
        let send_to_server = send_to_server.clone();
        let cancel_token = cancel_token.clone();
        let recv_from_queue = recv_from_queue.clone();
        let pipeline = pipeline.clone();
        let join_handle = tokio::spawn(
            async move {
                worker::start(cancel_token, pipeline, recv_from_queue, send_to_server).await;
            }
            .instrument(info_span!("worker")),
        );
        workers.push(join_handle);
    }
    drop(send_to_server);

    let resumable = if requeue_processing {
        requeue_stale(store.as_ref(), queue.as_ref()).await?
    } else {
        HashSet::new()
    };

    let dispatcher = {
        let cancel_token = cancel_token.clone();
        let store = store.clone();
        let queue = queue.clone();
        tokio::spawn(
            dispatch(cancel_token, store, queue, send_to_queue, resumable)
                .instrument(info_span!("dispatcher")),
        )
    };

    info!(workers = workers_count, queue = queue.name(), "Server started");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            chan_msg = recv_from_worker.recv() => {
                match chan_msg {
                    None => {
                        debug!("Worker channel closed unexpectedly, exiting");
                        cancel_token.cancel();
                        break;
                    },
                    Some(msg) => apply(store.as_ref(), msg).await,
                }
            },
        }
    }

    let in_hand = dispatcher.await?;
    // Wait for all workers to complete
    futures::future::join_all(workers)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    // Record whatever the workers finished while shutting down.
    while let Ok(msg) = recv_from_worker.try_recv() {
        apply(store.as_ref(), msg).await;
    }

    let mut undelivered = Vec::new();
    while let Ok(Dispatch { job, .. }) = recv_from_queue.try_recv() {
        undelivered.push(job.job_id);
    }
    undelivered.extend(in_hand);
    return_undelivered(store.as_ref(), queue.as_ref(), &undelivered).await;

    info!("Server stopped.");

    Ok(())
}

/// Pops job ids, claims them and feeds the worker pool. Blocks while
/// every worker is busy, so admission stays in queue order. Returns the
/// id of a claimed job still in hand at shutdown.
async fn dispatch(
    cancel_token: CancellationToken,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    send_to_queue: Sender<Dispatch>,
    mut resumable: HashSet<String>,
) -> Option<String> {
    while !cancel_token.is_cancelled() {
        let job_id = match queue.pop().await {
            Ok(Some(job_id)) => job_id,
            Ok(None) => continue,
            Err(err) => {
                error!(error = %err, "Queue pop failed, retrying");
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_DELAY) => continue,
                }
            }
        };

        let resume = resumable.contains(&job_id);
        let claimed = match store.fetch_job(&job_id).await {
            Ok(Some(job)) if job.status.is_terminal() => {
                info!(job_id, status = %job.status, "Job already finished, skipping");
                continue;
            }
            Ok(Some(job)) => store.claim_job(&job_id, resume).await.map(|ok| ok.then_some(job)),
            Ok(None) => {
                warn!(job_id, "Queued job not found, skipping");
                continue;
            }
            Err(err) => Err(err),
        };

        let mut job = match claimed {
            Ok(Some(job)) => job,
            Ok(None) => {
                info!(job_id, "Job claimed by another run, skipping");
                continue;
            }
            Err(err) => {
                error!(job_id, error = %err, "Failed to claim queued job, requeueing");
                if let Err(err) = queue.requeue(&job_id).await {
                    error!(job_id, error = %err, "Failed to requeue job");
                }
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_DELAY) => continue,
                }
            }
        };
        resumable.remove(&job_id);
        job.status = Status::Processing;

        let route = Route::resolve(&job);
        debug!(job_id, %route, "Dispatching job");
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                warn!(job_id, "Shutdown before job was picked up");
                return Some(job_id);
            },
            sent = send_to_queue.send(Dispatch { job, route }) => {
                if let Err(err) = sent {
                    error!(error = %err, "Worker pool closed, dispatcher exiting");
                    return Some(job_id);
                }
            },
        }
    }
    debug!("Dispatcher stopped");
    None
}

/// Pushes jobs a previous process left in `processing` back on the queue
/// and returns their ids, which may be claimed while still processing.
async fn requeue_stale(store: &dyn JobStore, queue: &dyn WorkQueue) -> Result<HashSet<String>, Error> {
    let stale = store.processing_job_ids().await?;
    for job_id in &stale {
        queue.push(job_id).await?;
    }
    if !stale.is_empty() {
        info!(count = stale.len(), "Requeued processing jobs");
    }
    Ok(stale.into_iter().collect())
}

/// Hands claimed jobs no worker took back to pending and puts them at the
/// head of the queue, oldest popped first.
async fn return_undelivered(store: &dyn JobStore, queue: &dyn WorkQueue, job_ids: &[String]) {
    for job_id in job_ids.iter().rev() {
        if let Err(err) = store.release_job(job_id).await {
            error!(job_id, error = %err, "Failed to release job");
        }
        if let Err(err) = queue.requeue(job_id).await {
            error!(job_id, error = %err, "Failed to requeue job, it stays pending");
        }
    }
    if !job_ids.is_empty() {
        info!(count = job_ids.len(), "Returned undelivered jobs to the queue");
    }
}

/// The only place a claimed job's final status is written.
async fn apply(store: &dyn JobStore, msg: WorkMessage) {
    match msg {
        WorkMessage::JobFinished(job_id, production_id, outcome) => {
            debug!(message = "Finished job", job_id, status = %outcome.status);
            record_outcome(store, &job_id, production_id.as_deref(), outcome).await;
        }
    }
}

async fn record_outcome(
    store: &dyn JobStore,
    job_id: &str,
    production_id: Option<&str>,
    outcome: JobOutcome,
) {
    let written = match outcome.status {
        Status::Failed => {
            let msg = outcome.error.as_deref().unwrap_or("generation failed");
            store.fail_job(job_id, msg).await
        }
        status => store.finish_job(job_id, status).await,
    };
    match written {
        Ok(true) => {}
        Ok(false) => warn!(job_id, "Job already terminal, status left as is"),
        Err(err) => error!(job_id, error = %err, "Failed to record job status"),
    }

    if let Some(production_id) = production_id {
        if let Err(err) = store
            .update_production(production_id, outcome.status, &outcome.attachment_ids)
            .await
        {
            error!(job_id, production_id, error = %err, "Failed to update production");
        }
    }
}
