use crate::category::Route;
use crate::pipeline::{JobOutcome, Pipeline};
use crate::Job;
use async_channel::Receiver;
use std::fmt::Debug;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// A job handed from the dispatcher to the pool, already routed.
#[derive(Debug)]
pub struct Dispatch {
    pub job: Job,
    pub route: Route,
}

#[derive(Debug)]
pub enum WorkMessage {
    JobFinished(String, Option<String>, JobOutcome),
}

pub async fn start(
    cancel_token: CancellationToken,
    pipeline: Pipeline,
    recv_from_queue: Receiver<Dispatch>,
    send_to_server: UnboundedSender<WorkMessage>,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            dispatch = recv_from_queue.recv() => {
                let Dispatch { job, route } = match dispatch {
                    Err(err) => {
                        error!(message="Error receiving job by worker, exiting", error=?err);
                        break;
                    },
                    Ok(dispatch) => dispatch,
                };

                let job_id = job.job_id.clone();
                debug!(job_id, "Starting job");
                let outcome = pipeline.process(&job, route).await;
                let finished = WorkMessage::JobFinished(job_id.clone(), job.production_id, outcome);
                if send_to_server.send(finished).is_err() {
                    error!(job_id, "Server gone, outcome not recorded");
                    break;
                }
            }
        }
    }
    info!("Worker stopped.");
}
