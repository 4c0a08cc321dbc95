//! Handles for in-flight remote writes.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::task::JoinHandle;

use crate::error::{StoreError, SyncError};
use crate::types::Collection;

/// Kind of remote write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Put,
    Delete,
}

/// A remote write that was applied locally but rejected by the store.
#[derive(Debug, Clone)]
pub struct WriteFailure {
    pub collection: Collection,
    pub id: String,
    pub operation: WriteOp,
    pub error: StoreError,
}

/// The remote half of an optimistic mutation.
///
/// The local cache already reflects the mutation when this is returned.
/// Awaiting it yields the remote outcome; dropping it leaves the remote
/// operation running.
#[derive(Debug)]
pub struct PendingWrite {
    inner: Inner,
}

#[derive(Debug)]
enum Inner {
    Spawned(JoinHandle<Result<(), SyncError>>),
    Ready(Option<Result<(), SyncError>>),
}

impl PendingWrite {
    pub(crate) fn spawned(handle: JoinHandle<Result<(), SyncError>>) -> Self {
        Self {
            inner: Inner::Spawned(handle),
        }
    }

    /// A write that resolved without reaching the remote store.
    pub fn ready(result: Result<(), SyncError>) -> Self {
        Self {
            inner: Inner::Ready(Some(result)),
        }
    }

    /// Whether the outcome is already available.
    pub fn is_finished(&self) -> bool {
        match &self.inner {
            Inner::Spawned(handle) => handle.is_finished(),
            Inner::Ready(_) => true,
        }
    }
}

impl Future for PendingWrite {
    type Output = Result<(), SyncError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            Inner::Spawned(handle) => Pin::new(handle).poll(cx).map(|joined| match joined {
                Ok(result) => result,
                Err(e) => Err(SyncError::Task(e.to_string())),
            }),
            Inner::Ready(result) => Poll::Ready(result.take().unwrap_or(Ok(()))),
        }
    }
}
