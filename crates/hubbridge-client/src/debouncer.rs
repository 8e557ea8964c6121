//! Fetch debouncer.
//!
//! Registry invalidations arrive in bursts. Kinds are collected in a set
//! behind one shared timer; when the window closes each distinct kind is
//! fetched once.

use std::collections::BTreeSet;
use tokio::task::JoinHandle;

use crate::registry::ResourceKind;

/// Pending resource kinds and the timer that will flush them.
///
/// A timer that has fired keeps running while it fetches; its handle moves
/// to `flushing` so [`cancel`](FetchQueue::cancel) can still stop it.
#[derive(Debug, Default)]
pub struct FetchQueue {
    pending: BTreeSet<ResourceKind>,
    timer: Option<JoinHandle<()>>,
    flushing: Vec<JoinHandle<()>>,
}

impl FetchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a kind. Returns `true` when the caller must arm the timer.
    pub fn enqueue(&mut self, kind: ResourceKind) -> bool {
        self.pending.insert(kind);
        self.timer.is_none()
    }

    /// Record the timer armed after [`enqueue`](Self::enqueue) returned `true`.
    pub fn set_timer(&mut self, timer: JoinHandle<()>) {
        self.timer = Some(timer);
    }

    /// Take every pending kind and mark the timer as flushing.
    ///
    /// Called by the timer itself when the window closes, so kinds enqueued
    /// while the fetches run open a new window.
    pub fn drain(&mut self) -> Vec<ResourceKind> {
        self.flushing.retain(|task| !task.is_finished());
        if let Some(timer) = self.timer.take() {
            self.flushing.push(timer);
        }
        std::mem::take(&mut self.pending).into_iter().collect()
    }

    /// Cancel the timer, stop running flushes and forget pending kinds.
    pub fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        for task in self.flushing.drain(..) {
            task.abort();
        }
        self.pending.clear();
    }

    pub fn is_armed(&self) -> bool {
        self.timer.is_some()
    }

    /// Whether a fired timer may still be fetching.
    pub fn is_flushing(&self) -> bool {
        self.flushing.iter().any(|task| !task.is_finished())
    }

    pub fn pending(&self) -> impl Iterator<Item = &ResourceKind> {
        self.pending.iter()
    }
}
