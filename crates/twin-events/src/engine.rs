use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};
use twin_protocol::{
    AccessLevel, AccessMethod, AgentCallback, AgentId, MessageSink, MessageType,
    MethodAccessibility, PublicKey, SnaFilter, SnaMessage, SubscriptionId, uri,
};

use crate::callback::{CallbackStatus, SnaCallback};
use crate::clock::Clock;

/// Computes which methods an identity may use on a path.
pub trait AccessibilityResolver: Send + Sync {
    fn accessibility(&self, key: &PublicKey, path: &str) -> Vec<MethodAccessibility>;

    /// Whether `key` holds `required` for `method` on `path`, whatever the
    /// path currently requires.
    fn is_granted(
        &self,
        key: &PublicKey,
        path: &str,
        method: AccessMethod,
        required: AccessLevel,
    ) -> bool;
}

/// Told about callbacks the worker dropped on its own, after expiry or a
/// failure under [`ErrorPolicy::Remove`](twin_protocol::ErrorPolicy).
pub trait EvictionListener: Send + Sync {
    fn evicted(&self, ids: &[SubscriptionId]);
}

enum Command {
    Deliver(SnaMessage),
    Flush(oneshot::Sender<()>),
    Close,
}

struct FilterEntry {
    filter: SnaFilter,
    callbacks: Vec<SnaCallback>,
}

struct AgentEntry {
    key: PublicKey,
    filter: SnaFilter,
    callback: Arc<dyn AgentCallback>,
}

#[derive(Default)]
struct AgentTable {
    agents: IndexMap<AgentId, AgentEntry>,
    /// Memoized accessibility per agent key, then per message path.
    accessibility: HashMap<PublicKey, HashMap<String, Vec<MethodAccessibility>>>,
}

struct Shared {
    callbacks: Mutex<Vec<FilterEntry>>,
    agents: Mutex<AgentTable>,
    resolver: Arc<dyn AccessibilityResolver>,
    evictions: Option<Arc<dyn EvictionListener>>,
    clock: Arc<dyn Clock>,
    stopped: AtomicBool,
}

/// Single-consumer ordered message queue.
///
/// Producers push without blocking; one worker thread takes each message
/// through subscriber fan-out, then agent fan-out, before the next one.
pub struct DispatchEngine {
    queue: MessageQueue,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
}

/// Producer handle on the engine queue. Cheap to clone; usable before the
/// worker starts.
#[derive(Clone)]
pub struct MessageQueue {
    sender: mpsc::UnboundedSender<Command>,
}

impl MessageSink for MessageQueue {
    fn push(&self, message: SnaMessage) {
        if self.sender.send(Command::Deliver(message)).is_err() {
            debug!("message dropped: dispatch engine closed");
        }
    }
}

/// Queue created ahead of its worker, so producers and the accessibility
/// resolver can be wired before the engine runs.
pub struct EngineBuilder {
    sender: mpsc::UnboundedSender<Command>,
    receiver: mpsc::UnboundedReceiver<Command>,
    evictions: Option<Arc<dyn EvictionListener>>,
}

impl EngineBuilder {
    pub fn queue(&self) -> MessageQueue {
        MessageQueue {
            sender: self.sender.clone(),
        }
    }

    pub fn evictions(mut self, listener: Arc<dyn EvictionListener>) -> Self {
        self.evictions = Some(listener);
        self
    }

    pub fn start(
        self,
        resolver: Arc<dyn AccessibilityResolver>,
        clock: Arc<dyn Clock>,
    ) -> Result<DispatchEngine> {
        let shared = Arc::new(Shared {
            callbacks: Mutex::new(Vec::new()),
            agents: Mutex::new(AgentTable::default()),
            resolver,
            evictions: self.evictions,
            clock,
            stopped: AtomicBool::new(false),
        });
        let worker_shared = shared.clone();
        let receiver = self.receiver;
        let worker = thread::Builder::new()
            .name("twin-dispatch".to_owned())
            .spawn(move || run(worker_shared, receiver))
            .context("failed spawning dispatch worker")?;
        info!("dispatch engine started");
        Ok(DispatchEngine {
            queue: MessageQueue {
                sender: self.sender,
            },
            shared,
            worker: Mutex::new(Some(worker)),
            closing: AtomicBool::new(false),
        })
    }
}

impl DispatchEngine {
    pub fn builder() -> EngineBuilder {
        let (sender, receiver) = mpsc::unbounded_channel();
        EngineBuilder {
            sender,
            receiver,
            evictions: None,
        }
    }

    pub fn start(
        resolver: Arc<dyn AccessibilityResolver>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::builder().start(resolver, clock)
    }

    pub fn queue(&self) -> MessageQueue {
        self.queue.clone()
    }

    /// Attach `callback` to `filter`, sharing the entry of an equal filter.
    pub fn add_callback(&self, filter: SnaFilter, callback: SnaCallback) {
        debug!(subscription_id = %callback.id, sender = %filter.sender, "callback added");
        let mut table = self.shared.callbacks.lock();
        match table.iter_mut().find(|entry| entry.filter == filter) {
            Some(entry) => entry.callbacks.push(callback),
            None => table.push(FilterEntry {
                filter,
                callbacks: vec![callback],
            }),
        }
    }

    /// Remove a callback; its filter goes away with its last callback.
    pub fn delete_callback(&self, id: &SubscriptionId) -> bool {
        let mut table = self.shared.callbacks.lock();
        let mut removed = false;
        for entry in table.iter_mut() {
            let before = entry.callbacks.len();
            entry.callbacks.retain(|callback| callback.id != *id);
            removed |= entry.callbacks.len() != before;
        }
        table.retain(|entry| !entry.callbacks.is_empty());
        if removed {
            debug!(subscription_id = %id, "callback deleted");
        }
        removed
    }

    /// Number of filters whose sender is exactly `uri`.
    pub fn count(&self, uri: &str) -> usize {
        self.shared
            .callbacks
            .lock()
            .iter()
            .filter(|entry| entry.filter.sender == uri)
            .count()
    }

    #[instrument(skip(self, filter, callback), fields(agent_id = %id, public_key = %key))]
    pub fn register_agent(
        &self,
        id: AgentId,
        key: PublicKey,
        filter: SnaFilter,
        callback: Arc<dyn AgentCallback>,
    ) {
        self.shared.agents.lock().agents.insert(
            id,
            AgentEntry {
                key,
                filter,
                callback,
            },
        );
        debug!("agent registered");
    }

    #[instrument(skip(self), fields(agent_id = %id))]
    pub fn unregister_agent(&self, id: &AgentId) -> bool {
        let removed = {
            let mut table = self.shared.agents.lock();
            let removed = table.agents.shift_remove(id);
            if let Some(entry) = &removed
                && !table.agents.values().any(|other| other.key == entry.key)
            {
                table.accessibility.remove(&entry.key);
            }
            removed
        };
        match removed {
            Some(entry) => {
                entry.callback.stop();
                debug!("agent unregistered");
                true
            }
            None => false,
        }
    }

    /// Forget memoized accessibility for `key`.
    pub fn invalidate_accessibility(&self, key: &PublicKey) {
        if self.shared.agents.lock().accessibility.remove(key).is_some() {
            debug!(public_key = %key, "agent accessibility invalidated");
        }
    }

    /// Forget memoized accessibility of every key on `prefix` and below.
    pub fn invalidate_path(&self, prefix: &str) {
        self.shared.invalidate_path(prefix);
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.shared.agents.lock().agents.keys().cloned().collect()
    }

    /// Resolves once every message pushed before the call was processed.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.queue.sender.send(Command::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Stop the worker. `wait` drains the queued messages first; otherwise
    /// the worker stops after the message in progress.
    #[instrument(skip(self))]
    pub fn close(&self, wait: bool) {
        if !wait {
            self.shared.stopped.store(true, Ordering::Release);
        }
        self.closing.store(true, Ordering::Release);
        let _ = self.queue.sender.send(Command::Close);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker
            && worker.join().is_err()
        {
            warn!("dispatch worker panicked");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

impl MessageSink for DispatchEngine {
    fn push(&self, message: SnaMessage) {
        self.queue.push(message);
    }
}

impl Drop for DispatchEngine {
    fn drop(&mut self) {
        let _ = self.queue.sender.send(Command::Close);
    }
}

fn run(shared: Arc<Shared>, mut receiver: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = receiver.blocking_recv() {
        if shared.stopped.load(Ordering::Acquire) {
            break;
        }
        match command {
            Command::Deliver(message) => {
                shared.deliver_to_subscribers(&message);
                shared.deliver_to_agents(&message);
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
            Command::Close => break,
        }
    }
    shared.stop_agents();
    info!("dispatch engine stopped");
}

fn invoke(action: impl FnOnce() -> Result<()>) -> Option<String> {
    match catch_unwind(AssertUnwindSafe(action)) {
        Ok(Ok(())) => None,
        Ok(Err(error)) => Some(format!("{error:#}")),
        Err(_) => Some("callback panicked".to_owned()),
    }
}

impl Shared {
    fn deliver_to_subscribers(&self, message: &SnaMessage) {
        let now = self.clock.now();
        let mut evicted = Vec::new();
        let targets: Vec<SnaCallback> = {
            let mut table = self.callbacks.lock();
            let mut targets = Vec::new();
            for entry in table.iter_mut().filter(|entry| entry.filter.matches(message)) {
                entry.callbacks.retain(|callback| {
                    let evict = callback.is_evictable(now);
                    if evict {
                        debug!(subscription_id = %callback.id, "callback evicted");
                        evicted.push(callback.id.clone());
                    }
                    !evict
                });
                targets.extend(entry.callbacks.iter().cloned());
            }
            table.retain(|entry| !entry.callbacks.is_empty());
            targets
        };
        if let Some(listener) = self.evictions.as_ref().filter(|_| !evicted.is_empty()) {
            listener.evicted(&evicted);
        }

        for callback in targets {
            if let Some(error) = invoke(|| callback.recipient.callback(&callback.id, message)) {
                warn!(
                    subscription_id = %callback.id,
                    path = %message.path,
                    %error,
                    "subscriber callback failed"
                );
                self.mark_failed(&callback.id);
            }
        }
    }

    fn invalidate_path(&self, prefix: &str) {
        for per_path in self.agents.lock().accessibility.values_mut() {
            per_path.retain(|path, _| !uri::is_path_prefix(prefix, path));
        }
    }

    fn mark_failed(&self, id: &SubscriptionId) {
        let mut table = self.callbacks.lock();
        for callback in table
            .iter_mut()
            .flat_map(|entry| entry.callbacks.iter_mut())
            .filter(|callback| callback.id == *id)
        {
            callback.status = CallbackStatus::Error;
        }
    }

    fn deliver_to_agents(&self, message: &SnaMessage) {
        // Elements appear and disappear in queue order, so memoized entries
        // below a lifecycle path are stale from here on.
        if message.message_type() == MessageType::Lifecycle {
            self.invalidate_path(&message.path);
        }
        let method = message.kind.agent_method();
        let targets: Vec<(AgentId, Arc<dyn AgentCallback>)> = {
            let mut table = self.agents.lock();
            let AgentTable {
                agents,
                accessibility,
            } = &mut *table;
            agents
                .iter()
                .filter(|(_, agent)| agent.filter.matches(message))
                .filter(|(_, agent)| {
                    if let Some(required) = message.required_level {
                        return self
                            .resolver
                            .is_granted(&agent.key, &message.path, method, required);
                    }
                    let per_path = accessibility.entry(agent.key.clone()).or_default();
                    let set = per_path
                        .entry(message.path.clone())
                        .or_insert_with(|| self.resolver.accessibility(&agent.key, &message.path));
                    MethodAccessibility::lookup(set, method)
                })
                .map(|(id, agent)| (id.clone(), agent.callback.clone()))
                .collect()
        };

        for (id, callback) in targets {
            if let Some(error) = invoke(|| callback.register(message)) {
                warn!(agent_id = %id, path = %message.path, %error, "agent callback failed");
            }
        }
    }

    fn stop_agents(&self) {
        let agents: Vec<Arc<dyn AgentCallback>> = self
            .agents
            .lock()
            .agents
            .values()
            .map(|agent| agent.callback.clone())
            .collect();
        for agent in agents {
            let _ = invoke(|| {
                agent.stop();
                Ok(())
            });
        }
    }
}
