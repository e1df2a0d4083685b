//! Durable FIFO of job ids: producers `LPUSH`, the dispatcher `BRPOP`s.

use anyhow::Error;
use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

pub const DEFAULT_QUEUE: &str = "jobs:queue";

/// How long a single blocking pop waits before returning `None`.
const POP_TIMEOUT_SECS: f64 = 5.0;

#[async_trait]
pub trait WorkQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Appends a job id and returns the queue length afterwards.
    async fn push(&self, job_id: &str) -> Result<i64, Error>;

    /// Puts a popped job id back at the head, so it is popped next.
    async fn requeue(&self, job_id: &str) -> Result<(), Error>;

    /// Waits for the oldest job id. `None` means the wait timed out.
    async fn pop(&self) -> Result<Option<String>, Error>;
}

pub struct RedisQueue {
    name: String,
    client: redis::Client,
    producer: ConnectionManager,
    consumer: Mutex<Option<MultiplexedConnection>>,
}

impl RedisQueue {
    pub async fn connect(url: &str, name: impl Into<String>) -> Result<Self, Error> {
        let client = redis::Client::open(url)?;
        let producer = ConnectionManager::new(client.clone()).await?;
        Ok(RedisQueue {
            name: name.into(),
            client,
            producer,
            consumer: Mutex::new(None),
        })
    }
}

#[async_trait]
impl WorkQueue for RedisQueue {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(name = "queue.push", skip(self), fields(queue = %self.name))]
    async fn push(&self, job_id: &str) -> Result<i64, Error> {
        let mut conn = self.producer.clone();
        let len: i64 = redis::cmd("LPUSH")
            .arg(&self.name)
            .arg(job_id)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    #[instrument(name = "queue.requeue", skip(self), fields(queue = %self.name))]
    async fn requeue(&self, job_id: &str) -> Result<(), Error> {
        let mut conn = self.producer.clone();
        let _: i64 = redis::cmd("RPUSH")
            .arg(&self.name)
            .arg(job_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<String>, Error> {
        // Blocking pops get a connection of their own so they never stall
        // producers sharing the manager.
        let mut guard = self.consumer.lock().await;
        if guard.is_none() {
            *guard = Some(self.client.get_multiplexed_tokio_connection().await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Ok(None);
        };

        let popped: Result<Option<(String, String)>, _> = redis::cmd("BRPOP")
            .arg(&self.name)
            .arg(POP_TIMEOUT_SECS)
            .query_async(conn)
            .await;

        match popped {
            Ok(Some((_, job_id))) => {
                debug!(queue = %self.name, job_id, "Popped job");
                Ok(Some(job_id))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                *guard = None;
                Err(err.into())
            }
        }
    }
}
