//! Supervision tree for long-lived gateway tasks.
//!
//! Nodes form a tree. A parent owns its children; a child keeps only a weak
//! link back to its parent, so dropping a subtree never leaks through a cycle.
//!
//! ```text
//!            SupervisorRoot ("gateway")
//!              │
//!      ┌───────┴────────┐
//!   listener       health-probe
//! ```
//!
//! Failure flows up, cancellation flows down:
//! - [`SupervisionNode::fail`] records the first fatal cause on the node,
//!   cancels the node's subtree, and fails the parent with the same cause.
//!   A failed parent cancels its remaining children the same way.
//! - At the root the cause is published to [`SupervisorRoot::wait_fatal`],
//!   which the gateway's run loop turns into a graceful shutdown.
//!
//! A node keeps only its first cause. Later failures are logged and dropped.

use crate::error::FatalError;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug)]
struct NodeInner {
    name: String,
    token: CancellationToken,
    parent: Weak<NodeInner>,
    children: Mutex<Vec<Arc<NodeInner>>>,
    failure: Mutex<Option<FatalError>>,
    /// Set on the root only.
    fatal_tx: Option<watch::Sender<Option<FatalError>>>,
}

impl NodeInner {
    fn fail(&self, cause: FatalError) {
        {
            let mut failure = self.failure.lock();
            if let Some(first) = failure.as_ref() {
                debug!(node = %self.name, first = %first, dropped = %cause, "Node already failed");
                return;
            }
            *failure = Some(cause.clone());
        }

        error!(node = %self.name, cause = %cause, "Supervised node failed");
        self.token.cancel();

        if let Some(tx) = &self.fatal_tx {
            tx.send_replace(Some(cause));
            return;
        }

        match self.parent.upgrade() {
            Some(parent) => parent.fail(cause),
            None => warn!(node = %self.name, "Parent gone, failure not propagated"),
        }
    }
}

/// A handle to one node of the supervision tree. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SupervisionNode {
    inner: Arc<NodeInner>,
}

impl SupervisionNode {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Create a child node. The child is cancelled whenever this node is.
    pub fn child(&self, name: impl Into<String>) -> SupervisionNode {
        let inner = Arc::new(NodeInner {
            name: name.into(),
            token: self.inner.token.child_token(),
            parent: Arc::downgrade(&self.inner),
            children: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            fatal_tx: None,
        });
        self.inner.children.lock().push(Arc::clone(&inner));
        SupervisionNode { inner }
    }

    /// Names of this node's direct children.
    pub fn children(&self) -> Vec<String> {
        self.inner
            .children
            .lock()
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    /// Report a terminal failure. Only the first cause is kept.
    pub fn fail(&self, cause: FatalError) {
        self.inner.fail(cause);
    }

    pub fn failure(&self) -> Option<FatalError> {
        self.inner.failure.lock().clone()
    }

    /// Token that fires when this node or any ancestor is cancelled.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// Spawn a supervised task on a new child node.
    ///
    /// The task receives its node so it can observe cancellation. An `Err`
    /// return or a panic fails the node; `Ok` ends it quietly.
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, task: F) -> JoinHandle<()>
    where
        F: FnOnce(SupervisionNode) -> Fut,
        Fut: Future<Output = Result<(), FatalError>> + Send + 'static,
    {
        let node = self.child(name);
        let fut = task(node.clone());

        tokio::spawn(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => debug!(node = %node.name(), "Supervised task finished"),
                Ok(Err(cause)) => node.fail(cause),
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "panic".to_string());
                    node.fail(FatalError::TaskFailed {
                        task: node.name().to_string(),
                        reason,
                    });
                }
            }
        })
    }
}

/// Root of a supervision tree. Receives the first fatal cause.
#[derive(Debug)]
pub struct SupervisorRoot {
    node: SupervisionNode,
    fatal_rx: watch::Receiver<Option<FatalError>>,
}

impl SupervisorRoot {
    pub fn new(name: impl Into<String>) -> Self {
        let (fatal_tx, fatal_rx) = watch::channel(None);
        let inner = Arc::new(NodeInner {
            name: name.into(),
            token: CancellationToken::new(),
            parent: Weak::new(),
            children: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            fatal_tx: Some(fatal_tx),
        });

        Self {
            node: SupervisionNode { inner },
            fatal_rx,
        }
    }

    pub fn node(&self) -> &SupervisionNode {
        &self.node
    }

    /// The fatal cause, if one has reached the root.
    pub fn fatal(&self) -> Option<FatalError> {
        self.fatal_rx.borrow().clone()
    }

    /// Wait for the first fatal cause.
    pub async fn wait_fatal(&self) -> FatalError {
        let mut rx = self.fatal_rx.clone();
        loop {
            if let Some(cause) = rx.borrow_and_update().clone() {
                return cause;
            }
            if rx.changed().await.is_err() {
                // The sender lives in the root node, so this only happens
                // while the root is being dropped.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Cancel the whole tree without recording a failure.
    pub fn shutdown(&self) {
        self.node.inner.token.cancel();
    }
}
