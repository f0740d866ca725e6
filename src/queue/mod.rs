//! The shared queue set: Work, Result and Directive.
//!
//! A [`Queue`] is either an in-process FIFO or a handle onto the network
//! registry; both expose the same blocking and non-blocking operations, and
//! "nothing queued right now" is always an `Option`, never an error.

use std::{sync::Arc, time::Duration};

use rkyv::Archive;
use tokio::time::Instant;
use tracing::debug;

use crate::{
    config::QueueConfig,
    error::{Error, Result},
    protocol::{Directive, ResultMessage, WorkEnvelope},
};

mod auth;
mod client;
mod local;
pub mod registry;
mod wire;

pub use client::RegistryClient;
pub use local::LocalQueue;
pub use registry::RegistryServer;

use wire::{Request, Response};

/// Server-side wait for one remote blocking receive. The client re-issues
/// the request until an item arrives.
const REMOTE_WAIT: Duration = Duration::from_secs(10);

#[derive(Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[archive(check_bytes)]
pub enum QueueName {
    Work,
    Result,
    Directive,
}

/// Anything that can sit in one of the three queues.
#[derive(Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum Parcel {
    Work(WorkEnvelope),
    Result(ResultMessage),
    Directive(Directive),
}

impl Parcel {
    pub fn queue(&self) -> QueueName {
        match self {
            Parcel::Work(_) => QueueName::Work,
            Parcel::Result(_) => QueueName::Result,
            Parcel::Directive(_) => QueueName::Directive,
        }
    }
}

/// Ties a message type to the queue that carries it.
pub trait QueueMessage: Sized + Send + Sync + 'static {
    const QUEUE: QueueName;

    fn into_parcel(self) -> Parcel;

    fn from_parcel(parcel: Parcel) -> Option<Self>;
}

impl QueueMessage for WorkEnvelope {
    const QUEUE: QueueName = QueueName::Work;

    fn into_parcel(self) -> Parcel {
        Parcel::Work(self)
    }

    fn from_parcel(parcel: Parcel) -> Option<Self> {
        match parcel {
            Parcel::Work(envelope) => Some(envelope),
            _ => None,
        }
    }
}

impl QueueMessage for ResultMessage {
    const QUEUE: QueueName = QueueName::Result;

    fn into_parcel(self) -> Parcel {
        Parcel::Result(self)
    }

    fn from_parcel(parcel: Parcel) -> Option<Self> {
        match parcel {
            Parcel::Result(message) => Some(message),
            _ => None,
        }
    }
}

impl QueueMessage for Directive {
    const QUEUE: QueueName = QueueName::Directive;

    fn into_parcel(self) -> Parcel {
        Parcel::Directive(self)
    }

    fn from_parcel(parcel: Parcel) -> Option<Self> {
        match parcel {
            Parcel::Directive(directive) => Some(directive),
            _ => None,
        }
    }
}

enum Backend<T> {
    Local(Arc<LocalQueue<T>>),
    Remote(RegistryClient),
}

impl<T> Clone for Backend<T> {
    fn clone(&self) -> Self {
        match self {
            Backend::Local(queue) => Backend::Local(queue.clone()),
            Backend::Remote(client) => Backend::Remote(client.clone()),
        }
    }
}

/// A handle onto one named queue. Cloning yields another handle to the same
/// queue.
pub struct Queue<T> {
    backend: Backend<T>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
        }
    }
}

impl<T: QueueMessage> Queue<T> {
    pub fn local() -> Self {
        Self {
            backend: Backend::Local(Arc::new(LocalQueue::new())),
        }
    }

    pub fn remote(client: RegistryClient) -> Self {
        Self {
            backend: Backend::Remote(client),
        }
    }

    pub async fn put(&self, item: T) -> Result<()> {
        match &self.backend {
            Backend::Local(queue) => {
                queue.put(item).await;
                Ok(())
            }
            Backend::Remote(client) => {
                match client.request(Request::Put(item.into_parcel())).await? {
                    Response::Done => Ok(()),
                    _ => Err(Error::UnexpectedResponse),
                }
            }
        }
    }

    /// Blocks until an item is available.
    pub async fn get(&self) -> Result<T> {
        match &self.backend {
            Backend::Local(queue) => Ok(queue.get().await),
            Backend::Remote(client) => loop {
                if let Some(item) = remote_get(client, T::QUEUE, REMOTE_WAIT).await? {
                    return Ok(item);
                }
            },
        }
    }

    /// Returns immediately; `None` means the queue was empty.
    pub async fn try_get(&self) -> Result<Option<T>> {
        self.get_timeout(Duration::ZERO).await
    }

    /// Waits at most `timeout` for an item.
    pub async fn get_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        match &self.backend {
            Backend::Local(queue) => Ok(queue.get_timeout(timeout).await),
            Backend::Remote(client) => {
                let deadline = Instant::now() + timeout;
                loop {
                    let wait = deadline
                        .saturating_duration_since(Instant::now())
                        .min(REMOTE_WAIT);
                    let item = remote_get(client, T::QUEUE, wait).await?;
                    if item.is_some() || Instant::now() >= deadline {
                        return Ok(item);
                    }
                }
            }
        }
    }

    pub async fn size(&self) -> Result<usize> {
        match &self.backend {
            Backend::Local(queue) => Ok(queue.size().await),
            Backend::Remote(client) => match client.request(Request::Size(T::QUEUE)).await? {
                Response::Size(n) => Ok(n as usize),
                _ => Err(Error::UnexpectedResponse),
            },
        }
    }

    /// Drops everything queued; returns how many items were dropped.
    pub async fn purge(&self) -> Result<usize> {
        match &self.backend {
            Backend::Local(queue) => Ok(queue.purge().await),
            Backend::Remote(client) => match client.request(Request::Purge(T::QUEUE)).await? {
                Response::Purged(n) => Ok(n as usize),
                _ => Err(Error::UnexpectedResponse),
            },
        }
    }
}

async fn remote_get<T: QueueMessage>(
    client: &RegistryClient,
    queue: QueueName,
    wait: Duration,
) -> Result<Option<T>> {
    let request = Request::Get {
        queue,
        wait_ms: wait.as_millis() as u64,
    };
    match client.request(request).await? {
        Response::Item(parcel) => T::from_parcel(parcel)
            .map(Some)
            .ok_or(Error::UnexpectedResponse),
        Response::Empty => Ok(None),
        _ => Err(Error::UnexpectedResponse),
    }
}

/// The three queues every process in a run shares.
#[derive(Clone)]
pub struct QueueSet {
    pub work: Queue<WorkEnvelope>,
    pub result: Queue<ResultMessage>,
    pub directive: Queue<Directive>,
}

impl QueueSet {
    /// Three fresh in-process queues.
    pub fn local() -> Self {
        Self {
            work: Queue::local(),
            result: Queue::local(),
            directive: Queue::local(),
        }
    }

    /// Handles onto the registry described by `config`.
    pub async fn connect(config: &QueueConfig) -> Result<Self> {
        let client = RegistryClient::connect(config).await?;
        Ok(Self::remote(client))
    }

    pub fn remote(client: RegistryClient) -> Self {
        Self {
            work: Queue::remote(client.clone()),
            result: Queue::remote(client.clone()),
            directive: Queue::remote(client),
        }
    }

    /// Empties all three queues, e.g. after a previous run died mid-phase.
    pub async fn purge_all(&self) -> Result<()> {
        let work = self.work.purge().await?;
        let result = self.result.purge().await?;
        let directive = self.directive.purge().await?;
        debug!(work, result, directive, "purged queue set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{WorkItem, WorkEnvelope};

    #[tokio::test]
    async fn local_set_round_trips_each_queue() {
        let queues = QueueSet::local();
        queues
            .work
            .put(WorkEnvelope {
                epoch: 1,
                item: WorkItem::SplitFbd {
                    county: "01001".into(),
                },
            })
            .await
            .unwrap();
        queues.directive.put(Directive::Shutdown).await.unwrap();

        assert_eq!(queues.work.size().await.unwrap(), 1);
        assert_eq!(queues.result.try_get().await.unwrap(), None);
        assert_eq!(queues.directive.get().await.unwrap(), Directive::Shutdown);

        queues.purge_all().await.unwrap();
        assert_eq!(queues.work.size().await.unwrap(), 0);
    }

    #[test]
    fn parcels_know_their_queue() {
        assert_eq!(Directive::Shutdown.into_parcel().queue(), QueueName::Directive);
        assert_eq!(WorkEnvelope::stop(3).into_parcel().queue(), QueueName::Work);
        assert!(ResultMessage::from_parcel(Directive::Shutdown.into_parcel()).is_none());
    }
}
