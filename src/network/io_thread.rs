//! Non-blocking I/O threads.
//!
//! Each thread runs the same loop:
//!
//! 1. drain the cross-thread task queue without blocking,
//! 2. select on the mio poller for at most `select_timeout`,
//! 3. dispatch every ready token to its handler.
//!
//! Draining tasks before selecting is what keeps wake-ups from getting lost:
//! a task added after the drain also wakes the poller through the waker.
//!
//! A handler is owned by exactly one thread at a time. Ownership only moves
//! through tasks processed on the owning thread itself.

use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};
use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::metrics::{IoThreadMetrics, IoThreadStats};

const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENT_CAPACITY: usize = 1024;

/// Something an I/O thread drives on readiness.
pub trait SelectionHandler: Send {
    /// State shared with other threads.
    fn shared(&self) -> &Arc<HandlerShared>;

    /// Called on the owning thread once the handler arrives there.
    fn register(&mut self, registry: &Registry) -> Result<()>;

    /// Called on the owning thread before the handler leaves it.
    fn deregister(&mut self, registry: &Registry);

    /// Process readiness or a self-scheduled wake-up.
    fn handle(&mut self, registry: &Registry) -> Result<()>;

    /// Called after `register` or `handle` failed. The handler is already
    /// removed from its thread.
    fn on_failure(&mut self, error: Error);
}

/// Which side of a connection a handler serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerRole {
    Reader,
    Writer,
}

/// The part of a handler visible to every thread: its token, its current
/// owner and its load.
pub struct HandlerShared {
    token: Token,
    role: HandlerRole,
    owner: RwLock<IoThreadHandle>,
    event_count: AtomicU64,
}

impl HandlerShared {
    pub fn new(token: Token, role: HandlerRole, owner: IoThreadHandle) -> Arc<Self> {
        Arc::new(Self {
            token,
            role,
            owner: RwLock::new(owner),
            event_count: AtomicU64::new(0),
        })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn role(&self) -> HandlerRole {
        self.role
    }

    /// Thread currently owning the handler.
    pub fn owner(&self) -> IoThreadHandle {
        self.owner.read().clone()
    }

    /// Readiness events handled so far. Used for balancing.
    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    pub(crate) fn record_event(&self) {
        self.event_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Ask the handler to move to `new_owner`. The current owner performs the handoff.
    pub fn request_migration(self: &Arc<Self>, new_owner: IoThreadHandle) {
        let owner = self.owner();
        if owner == new_owner {
            return;
        }
        owner.add_task_and_wakeup(IoTask::StartMigration {
            shared: self.clone(),
            new_owner,
        });
    }

    /// Ask the owner to run the handler.
    pub(crate) fn wake(self: &Arc<Self>) {
        self.owner().add_task_and_wakeup(IoTask::Handle(self.clone()));
    }

    /// Ask the owner to remove the handler.
    pub(crate) fn close(self: &Arc<Self>) {
        self.owner().add_task_and_wakeup(IoTask::Close(self.clone()));
    }

    fn set_owner(&self, owner: IoThreadHandle) {
        *self.owner.write() = owner;
    }
}

impl fmt::Debug for HandlerShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerShared")
            .field("token", &self.token.0)
            .field("role", &self.role)
            .field("owner", &self.owner.read().name())
            .field("event_count", &self.event_count())
            .finish()
    }
}

/// Work submitted to an I/O thread.
pub enum IoTask {
    /// Take ownership of a handler and register it.
    Register(Box<dyn SelectionHandler>),
    /// Run a handler, typically a writer that was scheduled.
    Handle(Arc<HandlerShared>),
    /// Hand a handler over to another thread.
    StartMigration {
        shared: Arc<HandlerShared>,
        new_owner: IoThreadHandle,
    },
    /// Deregister and drop a handler.
    Close(Arc<HandlerShared>),
    /// Run a closure on the I/O thread.
    Run(Box<dyn FnOnce() + Send>),
}

impl fmt::Debug for IoTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoTask::Register(h) => write!(f, "Register({})", h.shared().token.0),
            IoTask::Handle(s) => write!(f, "Handle({})", s.token.0),
            IoTask::StartMigration { shared, new_owner } => {
                write!(f, "StartMigration({} -> {})", shared.token.0, new_owner.name())
            }
            IoTask::Close(s) => write!(f, "Close({})", s.token.0),
            IoTask::Run(_) => write!(f, "Run"),
        }
    }
}

/// Settings of one I/O thread.
#[derive(Debug, Clone)]
pub struct IoThreadConfig {
    pub select_timeout: Duration,
    pub select_now: bool,
    pub selector_error_cooldown: Duration,
}

impl Default for IoThreadConfig {
    fn default() -> Self {
        Self {
            select_timeout: Duration::from_millis(5000),
            select_now: false,
            selector_error_cooldown: Duration::from_millis(1000),
        }
    }
}

struct IoThreadShared {
    index: usize,
    name: String,
    tasks: Sender<IoTask>,
    waker: Waker,
    stats: IoThreadStats,
    shutdown: AtomicBool,
}

/// Cloneable handle to a running I/O thread.
#[derive(Clone)]
pub struct IoThreadHandle {
    shared: Arc<IoThreadShared>,
}

impl IoThreadHandle {
    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queue a task and wake the thread if it is blocked in select.
    ///
    /// Returns false if the thread has terminated.
    pub fn add_task_and_wakeup(&self, task: IoTask) -> bool {
        if self.shared.tasks.send(task).is_err() {
            return false;
        }
        if let Err(e) = self.shared.waker.wake() {
            warn!(thread = %self.shared.name, error = %e, "failed to wake I/O thread");
        }
        true
    }

    /// Queue a task without waking the thread. Only for use on the thread itself.
    pub fn add_task(&self, task: IoTask) -> bool {
        self.shared.tasks.send(task).is_ok()
    }

    pub fn metrics(&self) -> IoThreadMetrics {
        self.shared.stats.snapshot(self.shared.name.clone())
    }

    /// Ask the thread to stop. Queued tasks are dropped and handlers deregistered.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let _ = self.shared.waker.wake();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    fn stats(&self) -> &IoThreadStats {
        &self.shared.stats
    }
}

impl PartialEq for IoThreadHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for IoThreadHandle {}

impl fmt::Debug for IoThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoThreadHandle")
            .field("index", &self.shared.index)
            .field("name", &self.shared.name)
            .finish()
    }
}

/// The event loop state owned by the I/O thread.
pub struct NonBlockingIoThread {
    me: IoThreadHandle,
    poll: Poll,
    events: Events,
    tasks: Receiver<IoTask>,
    handlers: HashMap<Token, Box<dyn SelectionHandler>>,
    config: IoThreadConfig,
}

impl NonBlockingIoThread {
    /// Create the thread state without starting it.
    pub fn new(index: usize, name: impl Into<String>, config: IoThreadConfig) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (tx, rx) = unbounded();
        let me = IoThreadHandle {
            shared: Arc::new(IoThreadShared {
                index,
                name: name.into(),
                tasks: tx,
                waker,
                stats: IoThreadStats::new(),
                shutdown: AtomicBool::new(false),
            }),
        };
        Ok(Self {
            me,
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            tasks: rx,
            handlers: HashMap::new(),
            config,
        })
    }

    pub fn handle(&self) -> IoThreadHandle {
        self.me.clone()
    }

    /// Spawn the loop on its own OS thread. `done` is dropped when the thread exits.
    pub fn spawn(self, done: Sender<()>) -> Result<(IoThreadHandle, JoinHandle<()>)> {
        let handle = self.me.clone();
        let join = thread::Builder::new()
            .name(handle.name().to_string())
            .spawn(move || {
                let _done = done;
                self.run();
            })?;
        Ok((handle, join))
    }

    /// Run the loop on the current thread until shutdown.
    pub fn run(mut self) {
        info!(thread = %self.me.name(), "I/O thread started");
        let timeout = if self.config.select_now {
            Duration::ZERO
        } else {
            self.config.select_timeout
        };

        while !self.me.is_shutdown() {
            self.process_task_queue();
            if self.me.is_shutdown() {
                break;
            }

            match self.poll.poll(&mut self.events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.on_selector_error(e);
                    continue;
                }
            }

            if !self.events.is_empty() {
                self.me.stats().last_select.touch();
            }
            self.dispatch_events();
        }

        self.close_all();
        info!(thread = %self.me.name(), "I/O thread stopped");
    }

    fn on_selector_error(&self, error: io::Error) {
        self.me.stats().selector_io_exception_count.inc();
        warn!(
            thread = %self.me.name(),
            error = %error,
            cooldown_ms = self.config.selector_error_cooldown.as_millis() as u64,
            "select failed"
        );
        thread::sleep(self.config.selector_error_cooldown);
    }

    fn process_task_queue(&mut self) {
        loop {
            match self.tasks.try_recv() {
                Ok(task) => {
                    self.me.stats().completed_task_count.inc();
                    self.execute_task(task);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
            }
        }
    }

    fn execute_task(&mut self, task: IoTask) {
        trace!(thread = %self.me.name(), ?task, "executing I/O task");
        match task {
            IoTask::Register(handler) => self.register(handler),
            IoTask::Handle(shared) => {
                if self.handlers.contains_key(&shared.token) {
                    self.run_handler(shared.token);
                } else {
                    self.forward(&shared, IoTask::Handle(shared.clone()));
                }
            }
            IoTask::StartMigration { shared, new_owner } => {
                if self.handlers.contains_key(&shared.token) {
                    self.start_migration(shared.token, new_owner);
                } else {
                    let task = IoTask::StartMigration {
                        shared: shared.clone(),
                        new_owner,
                    };
                    self.forward(&shared, task);
                }
            }
            IoTask::Close(shared) => match self.handlers.remove(&shared.token) {
                Some(mut handler) => {
                    handler.deregister(self.poll.registry());
                    self.me.stats().handler_count.dec();
                }
                None => self.forward(&shared, IoTask::Close(shared.clone())),
            },
            IoTask::Run(f) => {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
                    warn!(thread = %self.me.name(), ?panic, "I/O task panicked");
                }
            }
        }
    }

    /// Pass a task on to the handler's current owner. A handler that is not
    /// here and still names this thread as owner has been closed.
    fn forward(&self, shared: &HandlerShared, task: IoTask) {
        let owner = shared.owner();
        if owner == self.me {
            trace!(thread = %self.me.name(), token = shared.token.0, "dropping task for removed handler");
            return;
        }
        owner.add_task_and_wakeup(task);
    }

    fn register(&mut self, mut handler: Box<dyn SelectionHandler>) {
        let token = handler.shared().token;
        match handler.register(self.poll.registry()) {
            Ok(()) => {
                debug!(thread = %self.me.name(), token = token.0, "handler registered");
                self.handlers.insert(token, handler);
                self.me.stats().handler_count.inc();
            }
            Err(e) => {
                handler.deregister(self.poll.registry());
                handler.on_failure(e);
            }
        }
    }

    fn start_migration(&mut self, token: Token, new_owner: IoThreadHandle) {
        if new_owner == self.me {
            return;
        }
        let Some(mut handler) = self.handlers.remove(&token) else {
            return;
        };
        handler.deregister(self.poll.registry());
        self.me.stats().handler_count.dec();

        let shared = handler.shared().clone();
        debug!(
            token = token.0,
            from = %self.me.name(),
            to = %new_owner.name(),
            "migrating handler"
        );
        // Register first, then publish the new owner: anything sent to the new
        // owner after it is published queues behind the registration.
        if new_owner.add_task_and_wakeup(IoTask::Register(handler)) {
            shared.set_owner(new_owner);
        }
    }

    fn dispatch_events(&mut self) {
        let tokens: Vec<Token> = self
            .events
            .iter()
            .map(|e| e.token())
            .filter(|t| *t != WAKER_TOKEN)
            .collect();
        for token in tokens {
            if let Some(handler) = self.handlers.get(&token) {
                handler.shared().record_event();
                self.me.stats().event_count.inc();
                self.run_handler(token);
            }
        }
    }

    fn run_handler(&mut self, token: Token) {
        let registry = self.poll.registry();
        let Some(handler) = self.handlers.get_mut(&token) else {
            return;
        };
        let result = match catch_unwind(AssertUnwindSafe(|| handler.handle(registry))) {
            Ok(result) => result,
            Err(_) => Err(Error::OperationFailed("handler panicked".to_string())),
        };
        if let Err(e) = result {
            if let Some(mut handler) = self.handlers.remove(&token) {
                handler.deregister(registry);
                self.me.stats().handler_count.dec();
                handler.on_failure(e);
            }
        }
    }

    fn close_all(&mut self) {
        let dropped = self.tasks.try_iter().count();
        let registry = self.poll.registry();
        for (_, mut handler) in self.handlers.drain() {
            handler.deregister(registry);
        }
        self.me.stats().handler_count.set(0);
        debug!(thread = %self.me.name(), dropped_tasks = dropped, "I/O thread cleared");
    }
}

impl fmt::Debug for NonBlockingIoThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonBlockingIoThread")
            .field("name", &self.me.name())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct CountingHandler {
        shared: Arc<HandlerShared>,
        handled: Arc<AtomicUsize>,
        registered_on: Arc<RwLock<Vec<String>>>,
    }

    impl SelectionHandler for CountingHandler {
        fn shared(&self) -> &Arc<HandlerShared> {
            &self.shared
        }

        fn register(&mut self, _registry: &Registry) -> Result<()> {
            let owner = thread::current().name().unwrap_or_default().to_string();
            self.registered_on.write().push(owner);
            Ok(())
        }

        fn deregister(&mut self, _registry: &Registry) {}

        fn handle(&mut self, _registry: &Registry) -> Result<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_failure(&mut self, _error: Error) {}
    }

    fn spawn(index: usize) -> (IoThreadHandle, JoinHandle<()>, Receiver<()>) {
        let (done_tx, done_rx) = bounded(0);
        let thread = NonBlockingIoThread::new(index, format!("test-io-{index}"), IoThreadConfig::default())
            .unwrap();
        let (handle, join) = thread.spawn(done_tx).unwrap();
        (handle, join, done_rx)
    }

    fn wait_until(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_tasks_run_without_readiness() {
        let (io, join, _done) = spawn(0);
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        assert!(io.add_task_and_wakeup(IoTask::Run(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }))));

        assert!(wait_until(|| ran.load(Ordering::SeqCst) == 1));
        assert!(wait_until(|| io.metrics().completed_task_count == 1));
        io.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn test_handler_migration_and_forwarding() {
        let (a, join_a, _da) = spawn(1);
        let (b, join_b, _db) = spawn(2);
        let handled = Arc::new(AtomicUsize::new(0));
        let registered_on = Arc::new(RwLock::new(Vec::new()));
        let shared = HandlerShared::new(Token(7), HandlerRole::Writer, a.clone());

        a.add_task_and_wakeup(IoTask::Register(Box::new(CountingHandler {
            shared: shared.clone(),
            handled: handled.clone(),
            registered_on: registered_on.clone(),
        })));
        assert!(wait_until(|| a.metrics().handler_count == 1));

        shared.request_migration(b.clone());
        assert!(wait_until(|| shared.owner() == b));
        assert!(wait_until(|| b.metrics().handler_count == 1));
        assert_eq!(a.metrics().handler_count, 0);

        // A wake-up sent to the old owner is forwarded to the new one.
        a.add_task_and_wakeup(IoTask::Handle(shared.clone()));
        assert!(wait_until(|| handled.load(Ordering::SeqCst) == 1));

        assert_eq!(
            registered_on.read().clone(),
            vec!["test-io-1".to_string(), "test-io-2".to_string()]
        );

        shared.close();
        assert!(wait_until(|| b.metrics().handler_count == 0));

        a.shutdown();
        b.shutdown();
        join_a.join().unwrap();
        join_b.join().unwrap();
    }

    #[test]
    fn test_shutdown_terminates_blocked_select() {
        let (io, join, done) = spawn(3);
        io.shutdown();
        let start = Instant::now();
        assert!(matches!(
            done.recv_timeout(Duration::from_secs(3)),
            Err(crossbeam::channel::RecvTimeoutError::Disconnected)
        ));
        assert!(start.elapsed() < Duration::from_secs(3));
        join.join().unwrap();
    }
}
