//! Engine session: one engine instance plus its event pump thread.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::completion::{PendingCompletion, WaitTarget};
use super::{EngineError, EngineEvent, SwarmEngine};

type Listener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Handle returned by [`EngineSession::register_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct ListenerTable {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, Listener)>>,
}

impl ListenerTable {
    fn insert(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((id, listener));
        id
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    fn snapshot(&self) -> Vec<Listener> {
        self.entries
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Owns one swarm engine instance and the thread pumping its events.
///
/// The pump waits for events with a bounded timeout so shutdown is noticed
/// within one poll interval. Each event is offered to every listener
/// registered at the time it is dispatched. A panicking listener is logged
/// and skipped; it never takes the pump down.
pub struct EngineSession {
    engine: Arc<dyn SwarmEngine>,
    listeners: Arc<ListenerTable>,
    shutdown: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
    poll_interval: Duration,
}

impl EngineSession {
    /// Starts the pump thread for `engine`.
    ///
    /// # Errors
    /// - `EngineError::Io` - Pump thread could not be spawned
    pub fn start(
        engine: Arc<dyn SwarmEngine>,
        poll_interval: Duration,
    ) -> Result<Arc<Self>, EngineError> {
        let listeners = Arc::new(ListenerTable::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let pump = {
            let engine = Arc::clone(&engine);
            let listeners = Arc::clone(&listeners);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("undertow-pump".to_string())
                .spawn(move || pump_events(&*engine, &listeners, &shutdown, poll_interval))?
        };

        debug!(poll_interval_ms = poll_interval.as_millis() as u64, "Engine session started");

        Ok(Arc::new(Self {
            engine,
            listeners,
            shutdown,
            pump: Mutex::new(Some(pump)),
            poll_interval,
        }))
    }

    pub fn engine(&self) -> &dyn SwarmEngine {
        &*self.engine
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Adds a listener called from the pump thread for every event.
    ///
    /// Listeners must return quickly; they run inline on the pump.
    pub fn register_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.listeners.insert(Arc::new(listener))
    }

    /// Returns false if the listener was already gone.
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Registers interest in `target` and returns the pending wait.
    ///
    /// Register before triggering the engine action the wait depends on, so
    /// the answering event cannot slip past.
    pub fn begin_wait(self: &Arc<Self>, target: WaitTarget) -> PendingCompletion {
        PendingCompletion::register(Arc::clone(self), target)
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);

        if let Some(pump) = self.pump.lock().take() {
            if pump.thread().id() == thread::current().id() {
                return;
            }
            if pump.join().is_err() {
                warn!("Engine pump thread panicked");
            }
        }

        debug!("Engine session stopped");
    }
}

fn pump_events(
    engine: &dyn SwarmEngine,
    listeners: &ListenerTable,
    shutdown: &AtomicBool,
    poll_interval: Duration,
) {
    while !shutdown.load(Ordering::Acquire) {
        let events = engine.poll_events(poll_interval);
        if events.is_empty() {
            continue;
        }

        let snapshot = listeners.snapshot();
        for event in &events {
            trace!(?event, listeners = snapshot.len(), "Dispatching engine event");
            for listener in &snapshot {
                if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                    warn!(info_hash = %event.info_hash(), "Event listener panicked");
                }
            }
        }
    }
}
