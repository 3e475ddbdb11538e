// ABOUTME: Work items, the cooperative work queue and the external stimulus inbox
// ABOUTME: External threads marshal resumptions, completions and cancels onto the single worker

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::bookmark::{Bookmark, BookmarkResumptionResult};
use super::context::{CompletedChild, FaultContext};
use super::error::{ExecutionError, Fault, Result};
use super::instance::{Continuation, InstanceId};
use crate::definition::Value;

/// One schedulable unit of deferred execution. Every item targets exactly one
/// instance and counts toward that instance's busy count while queued.
#[derive(Debug, Clone)]
pub enum WorkItem {
    /// Start argument resolution. `overrides` carries host inputs for the root.
    Execute {
        instance: InstanceId,
        overrides: Option<IndexMap<String, Value>>,
    },
    ExecuteBody {
        instance: InstanceId,
    },
    Completion {
        owner: InstanceId,
        continuation: Continuation,
        child: CompletedChild,
    },
    Fault {
        owner: InstanceId,
        callback: String,
        context: FaultContext,
    },
    BookmarkResumed {
        owner: InstanceId,
        callback: String,
        bookmark: Bookmark,
        value: Value,
    },
    Cancel {
        instance: InstanceId,
    },
    /// Only re-runs the target's decision function.
    Empty {
        instance: InstanceId,
    },
    CompleteOperation {
        instance: InstanceId,
        operation: OperationId,
        outcome: std::result::Result<Value, Fault>,
    },
}

impl WorkItem {
    pub fn target(&self) -> InstanceId {
        match self {
            WorkItem::Execute { instance, .. }
            | WorkItem::ExecuteBody { instance }
            | WorkItem::Cancel { instance }
            | WorkItem::Empty { instance }
            | WorkItem::CompleteOperation { instance, .. } => *instance,
            WorkItem::Completion { owner, .. }
            | WorkItem::Fault { owner, .. }
            | WorkItem::BookmarkResumed { owner, .. } => *owner,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkItem::Execute { .. } => "execute",
            WorkItem::ExecuteBody { .. } => "execute_body",
            WorkItem::Completion { .. } => "completion",
            WorkItem::Fault { .. } => "fault",
            WorkItem::BookmarkResumed { .. } => "bookmark_resumed",
            WorkItem::Cancel { .. } => "cancel",
            WorkItem::Empty { .. } => "empty",
            WorkItem::CompleteOperation { .. } => "complete_operation",
        }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.name(), self.target())
    }
}

/// Double-ended work queue drained by the single logical worker.
#[derive(Debug, Default)]
pub struct Scheduler {
    queue: VecDeque<WorkItem>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `item` before anything already queued.
    pub fn push_work(&mut self, item: WorkItem) {
        self.queue.push_front(item);
    }

    pub fn enqueue_work(&mut self, item: WorkItem) {
        self.queue.push_back(item);
    }

    pub fn next(&mut self) -> Option<WorkItem> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkItem> {
        self.queue.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) -> Vec<WorkItem> {
        self.queue.drain(..).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Something that happened outside the worker and must be applied on it.
#[derive(Debug)]
pub enum Stimulus {
    ResumeBookmark {
        bookmark: Bookmark,
        value: Value,
        reply: Option<oneshot::Sender<BookmarkResumptionResult>>,
    },
    CompleteOperation {
        operation: OperationId,
        outcome: std::result::Result<Value, Fault>,
    },
    Cancel,
    Abort {
        reason: String,
    },
}

#[derive(Debug)]
pub struct Inbox {
    sender: mpsc::UnboundedSender<Stimulus>,
    receiver: mpsc::UnboundedReceiver<Stimulus>,
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Inbox {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self { sender, receiver }
    }

    pub fn handle(&self) -> ExternalHandle {
        ExternalHandle {
            sender: self.sender.clone(),
        }
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<Stimulus> {
        self.sender.clone()
    }

    pub fn try_next(&mut self) -> Option<Stimulus> {
        self.receiver.try_recv().ok()
    }

    pub async fn next(&mut self) -> Option<Stimulus> {
        self.receiver.recv().await
    }
}

/// Cloneable, thread-safe handle for posting stimuli to a running tree.
#[derive(Debug, Clone)]
pub struct ExternalHandle {
    sender: mpsc::UnboundedSender<Stimulus>,
}

impl ExternalHandle {
    pub fn resume_bookmark(
        &self,
        bookmark: Bookmark,
        value: Value,
    ) -> Result<oneshot::Receiver<BookmarkResumptionResult>> {
        let (reply, receiver) = oneshot::channel();
        self.send(Stimulus::ResumeBookmark {
            bookmark,
            value,
            reply: Some(reply),
        })?;
        Ok(receiver)
    }

    pub fn request_cancel(&self) -> Result<()> {
        self.send(Stimulus::Cancel)
    }

    pub fn abort(&self, reason: &str) -> Result<()> {
        self.send(Stimulus::Abort {
            reason: reason.to_string(),
        })
    }

    fn send(&self, stimulus: Stimulus) -> Result<()> {
        self.sender
            .send(stimulus)
            .map_err(|_| ExecutionError::InboxClosed)
    }
}

/// An asynchronous operation started by an async activity. The host performs
/// the work anywhere and reports back through `complete` or `fail`.
#[derive(Debug)]
pub struct AsyncOperation {
    pub id: OperationId,
    pub instance: InstanceId,
    pub kind: String,
    pub request: Value,
    cancel: Arc<AtomicBool>,
    sender: mpsc::UnboundedSender<Stimulus>,
}

impl AsyncOperation {
    pub fn new(
        id: OperationId,
        instance: InstanceId,
        kind: &str,
        request: Value,
        cancel: Arc<AtomicBool>,
        sender: mpsc::UnboundedSender<Stimulus>,
    ) -> Self {
        Self {
            id,
            instance,
            kind: kind.to_string(),
            request,
            cancel,
            sender,
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn complete(self, value: Value) -> Result<()> {
        self.finish(Ok(value))
    }

    pub fn fail(self, fault: Fault) -> Result<()> {
        self.finish(Err(fault))
    }

    fn finish(self, outcome: std::result::Result<Value, Fault>) -> Result<()> {
        self.sender
            .send(Stimulus::CompleteOperation {
                operation: self.id,
                outcome,
            })
            .map_err(|_| ExecutionError::InboxClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_push_work_runs_first() {
        let mut scheduler = Scheduler::new();
        scheduler.enqueue_work(WorkItem::Empty {
            instance: InstanceId(1),
        });
        scheduler.enqueue_work(WorkItem::Empty {
            instance: InstanceId(2),
        });
        scheduler.push_work(WorkItem::Cancel {
            instance: InstanceId(3),
        });

        assert_eq!(scheduler.len(), 3);
        assert_eq!(scheduler.next().unwrap().target(), InstanceId(3));
        assert_eq!(scheduler.next().unwrap().target(), InstanceId(1));
        assert_eq!(scheduler.next().unwrap().target(), InstanceId(2));
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn test_external_handle_marshals_onto_inbox() {
        let mut inbox = Inbox::new();
        let handle = inbox.handle();

        let worker = std::thread::spawn(move || {
            handle
                .resume_bookmark(Bookmark::new("approve"), json!(true))
                .unwrap()
        });
        let reply = worker.join().unwrap();

        match inbox.next().await {
            Some(Stimulus::ResumeBookmark {
                bookmark,
                value,
                reply: Some(sender),
            }) => {
                assert_eq!(bookmark.name, "approve");
                assert_eq!(value, json!(true));
                sender.send(BookmarkResumptionResult::Success).unwrap();
            }
            other => panic!("unexpected stimulus: {:?}", other),
        }
        assert_eq!(reply.await.unwrap(), BookmarkResumptionResult::Success);
    }

    #[test]
    fn test_operation_completion_posts_stimulus() {
        let mut inbox = Inbox::new();
        let cancel = Arc::new(AtomicBool::new(false));
        let op = AsyncOperation::new(
            OperationId(7),
            InstanceId(1),
            "external_call",
            json!({"url": "x"}),
            cancel.clone(),
            inbox.sender(),
        );
        assert!(!op.is_cancel_requested());
        cancel.store(true, Ordering::SeqCst);
        assert!(op.is_cancel_requested());
        op.complete(json!(42)).unwrap();

        match inbox.try_next() {
            Some(Stimulus::CompleteOperation { operation, outcome }) => {
                assert_eq!(operation, OperationId(7));
                assert_eq!(outcome.unwrap(), json!(42));
            }
            other => panic!("unexpected stimulus: {:?}", other),
        }
    }
}
