//! Serialized delivery of notifications to the [`EventHandler`].
//!
//! The reconciler owns the handler and runs on one worker thread, so at most
//! one reconciliation is ever in flight. Failed applies with a transient
//! cause are retried after the requeue interval unless a newer notification
//! for the same identity arrives first.

use crate::handler::{EventHandler, ReconcileOutcome};
use crate::{CoreError, ErrorKind};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use wasmxds_provider::CancelToken;
use wasmxds_schema::{ExtensionResource, NamespacedName};

pub const DEFAULT_REQUEUE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Create or update.
    Apply(ExtensionResource),
    Delete(NamespacedName),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Only resources in this namespace are reconciled. `None` watches all.
    pub namespace: Option<String>,
    pub requeue_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
        }
    }
}

pub struct Reconciler {
    handler: EventHandler,
    config: ReconcilerConfig,
    cancel: CancelToken,
    /// Last applied resource per identity, so deletes know what to release.
    known: HashMap<NamespacedName, ExtensionResource>,
    /// Identities whose last apply failed, with the time of the next attempt.
    pending: HashMap<NamespacedName, Instant>,
}

fn is_transient(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::FetchFailed
            | ErrorKind::AuthenticationFailure
            | ErrorKind::LookupFailed
            | ErrorKind::KeyNotFound
    )
}

impl Reconciler {
    pub fn new(handler: EventHandler, config: ReconcilerConfig, cancel: CancelToken) -> Self {
        Self {
            handler,
            config,
            cancel,
            known: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn handler(&self) -> &EventHandler {
        &self.handler
    }

    pub fn in_scope(&self, namespace: &str) -> bool {
        self.config
            .namespace
            .as_deref()
            .is_none_or(|watched| watched == namespace)
    }

    /// Number of identities waiting for a retry.
    pub fn pending_retries(&self) -> usize {
        self.pending.len()
    }

    /// Reconcile `resource`. Out-of-scope resources are ignored (`Ok(None)`).
    pub fn apply(
        &mut self,
        resource: ExtensionResource,
    ) -> Result<Option<ReconcileOutcome>, CoreError> {
        if !self.in_scope(&resource.namespace) {
            debug!(
                "ignoring {}: outside watched namespace",
                resource.identity()
            );
            return Ok(None);
        }
        if let Err(e) = resource.validate() {
            warn!("rejecting {}: {e}", resource.identity());
            return Err(e.into());
        }

        let identity = resource.identity();
        self.pending.remove(&identity);
        self.known.insert(identity.clone(), resource);
        self.reconcile(&identity, Instant::now()).map(Some)
    }

    fn reconcile(
        &mut self,
        identity: &NamespacedName,
        now: Instant,
    ) -> Result<ReconcileOutcome, CoreError> {
        let Some(resource) = self.known.get(identity) else {
            return Err(CoreError::Schema(
                wasmxds_schema::SchemaError::InvalidIdentity(identity.to_string()),
            ));
        };
        match self.handler.update(&self.cancel, resource) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if is_transient(e.kind()) {
                    let due = now + self.config.requeue_interval;
                    error!(
                        "failed to reconcile {identity}: {e}; retrying in {:?}",
                        self.config.requeue_interval
                    );
                    self.pending.insert(identity.clone(), due);
                } else {
                    error!("failed to reconcile {identity}: {e}");
                }
                Err(e)
            }
        }
    }

    /// Retract the resource last applied under `identity`.
    ///
    /// Returns false when nothing was known under that identity.
    pub fn delete(&mut self, identity: &NamespacedName) -> bool {
        self.pending.remove(identity);
        match self.known.remove(identity) {
            Some(resource) => {
                self.handler.delete(&resource);
                true
            }
            None => {
                debug!("delete for unknown resource {identity}");
                false
            }
        }
    }

    /// Re-run every pending apply whose retry time is at or before `now`.
    pub fn retry_due(&mut self, now: Instant) {
        let due: Vec<NamespacedName> = self
            .pending
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for identity in due {
            self.pending.remove(&identity);
            info!("retrying {identity}");
            if let Ok(outcome) = self.reconcile(&identity, now) {
                debug!("retry of {} succeeded", outcome.name);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Handle one notification. Returns false on shutdown.
    pub fn handle(&mut self, notification: Notification) -> bool {
        match notification {
            Notification::Apply(resource) => {
                let identity = resource.identity();
                match self.apply(resource) {
                    Ok(Some(outcome)) => debug!("applied {}", outcome.name),
                    Ok(None) => {}
                    // Already logged and, when retryable, requeued.
                    Err(e) => debug!("apply of {identity} did not publish: {e}"),
                }
                true
            }
            Notification::Delete(identity) => {
                if self.in_scope(&identity.namespace) {
                    self.delete(&identity);
                }
                true
            }
            Notification::Shutdown => false,
        }
    }

    /// Process notifications until shutdown, cancellation, or every sender
    /// is dropped.
    pub fn run(mut self, notifications: &Receiver<Notification>) {
        info!("reconciler started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let next = match self.next_deadline() {
                Some(deadline) => {
                    notifications.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                }
                None => notifications
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };
            match next {
                Ok(notification) => {
                    if !self.handle(notification) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.retry_due(Instant::now());
        }
        info!("reconciler stopped");
    }

    /// Run on a dedicated thread.
    pub fn spawn(self) -> ReconcilerHandle {
        let (sender, receiver) = mpsc::channel();
        let join = std::thread::Builder::new()
            .name("reconciler".to_owned())
            .spawn(move || self.run(&receiver));
        match join {
            Ok(join) => ReconcilerHandle {
                sender,
                join: Some(join),
            },
            Err(e) => {
                error!("failed to spawn reconciler thread: {e}");
                ReconcilerHandle { sender, join: None }
            }
        }
    }
}

/// Sending side of a spawned [`Reconciler`].
pub struct ReconcilerHandle {
    sender: Sender<Notification>,
    join: Option<JoinHandle<()>>,
}

impl ReconcilerHandle {
    pub fn sender(&self) -> Sender<Notification> {
        self.sender.clone()
    }

    /// Queue a notification. Returns false if the worker has stopped.
    pub fn send(&self, notification: Notification) -> bool {
        self.sender.send(notification).is_ok()
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    /// Ask the worker to stop after the notifications already queued, and
    /// wait for it.
    pub fn shutdown(mut self) {
        let _ = self.sender.send(Notification::Shutdown);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("reconciler thread panicked");
            }
        }
    }
}
