// src/worker.rs
use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::Rng;
use rand::seq::SliceRandom;
use tracing::{debug, error, info, warn};

use crate::error::{EtudeError, EtudeResult};

/// One unit of work. Dropping it unexecuted releases everything it captured.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// How long an idle worker sleeps before it tries to steal again.
const STEAL_BACKOFF: Duration = Duration::from_millis(20);

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Pool id and queue of the worker running on this thread, if any.
    static CURRENT: RefCell<Option<(usize, Arc<Worker>)>> = const { RefCell::new(None) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    pub min: usize,
    pub max: usize,
    /// Supervisor tick.
    pub idle_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min: 2,
            max: num_cpus::get().max(2),
            idle_interval: Duration::from_millis(500),
        }
    }
}

struct Worker {
    id: usize,
    queue: Mutex<VecDeque<Task>>,
    cond: Condvar,
    should_run: AtomicBool,
}

impl Worker {
    fn new(id: usize) -> Self {
        Self {
            id,
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            should_run: AtomicBool::new(true),
        }
    }

    /// Queues at the tail unless the worker is retiring, in which case the
    /// task is handed back.
    fn push(&self, task: Task) -> Result<(), Task> {
        let mut q = lock(&self.queue);
        if !self.should_run.load(Ordering::Acquire) {
            return Err(task);
        }
        q.push_back(task);
        drop(q);
        self.cond.notify_one();
        Ok(())
    }

    fn pop(&self) -> Option<Task> {
        lock(&self.queue).pop_front()
    }

    fn retire(&self) {
        let _q = lock(&self.queue);
        self.should_run.store(false, Ordering::Release);
        self.cond.notify_one();
    }

    fn len(&self) -> usize {
        lock(&self.queue).len()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

struct Inner {
    id: usize,
    config: WorkerPoolConfig,
    workers: RwLock<Vec<Arc<Worker>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stopping: AtomicBool,
    next_worker_id: AtomicUsize,
    supervisor_lock: Mutex<()>,
    supervisor_cond: Condvar,
}

/// Dynamically sized pool of threads with per-worker FIFO queues and
/// tail stealing.
///
/// Tasks submitted from a worker thread land on that worker's own queue;
/// everything else goes to a random worker. A supervisor grows the pool
/// while work piles up and shrinks it back toward `min` when it drains.
pub struct WorkerPool {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> EtudeResult<Self> {
        if config.min == 0 || config.min > config.max {
            return Err(EtudeError::WorkerPool(format!(
                "invalid bounds: min={} max={}",
                config.min, config.max
            )));
        }

        let inner = Arc::new(Inner {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            config,
            workers: RwLock::new(Vec::with_capacity(config.max)),
            handles: Mutex::new(Vec::with_capacity(config.max)),
            stopping: AtomicBool::new(false),
            next_worker_id: AtomicUsize::new(0),
            supervisor_lock: Mutex::new(()),
            supervisor_cond: Condvar::new(),
        });

        let pool = Self {
            inner: inner.clone(),
            supervisor: Mutex::new(None),
        };
        for _ in 0..config.min {
            spawn_worker(&inner).map_err(|e| EtudeError::WorkerPool(e.to_string()))?;
        }

        let sup = inner.clone();
        let handle = thread::Builder::new()
            .name("etude-supervisor".to_string())
            .spawn(move || supervise(&sup))
            .map_err(|e| EtudeError::WorkerPool(e.to_string()))?;
        *lock(&pool.supervisor) = Some(handle);

        Ok(pool)
    }

    /// Queues `task`. After shutdown has begun the task is dropped unrun.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        submit(&self.inner, Box::new(task));
    }

    /// Current number of workers.
    pub fn size(&self) -> usize {
        self.inner.workers.read().map(|w| w.len()).unwrap_or_else(|p| p.into_inner().len())
    }

    /// Tasks queued but not yet started, across all workers.
    pub fn pending(&self) -> usize {
        pending(&self.inner)
    }

    /// Stops every thread. Running tasks finish; queued ones are dropped.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.stopping.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let _g = lock(&inner.supervisor_lock);
            inner.supervisor_cond.notify_all();
        }
        if let Some(h) = lock(&self.supervisor).take() {
            let _ = h.join();
        }

        let workers: Vec<Arc<Worker>> = match inner.workers.write() {
            Ok(mut w) => w.drain(..).collect(),
            Err(p) => p.into_inner().drain(..).collect(),
        };
        for w in &workers {
            let _q = lock(&w.queue);
            w.cond.notify_all();
        }

        let me = thread::current().id();
        let handles: Vec<JoinHandle<()>> = lock(&inner.handles).drain(..).collect();
        for h in handles {
            // a task that shuts the pool down cannot join its own thread
            if h.thread().id() != me {
                let _ = h.join();
            }
        }

        let dropped: usize = workers.iter().map(|w| lock(&w.queue).drain(..).count()).sum();
        if dropped > 0 {
            debug!(dropped, "discarded queued tasks at shutdown");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn submit(inner: &Inner, mut task: Task) {
    if inner.stopping.load(Ordering::Acquire) {
        return;
    }

    let own = CURRENT.with(|c| {
        c.borrow()
            .as_ref()
            .filter(|(pool_id, _)| *pool_id == inner.id)
            .map(|(_, w)| w.clone())
    });
    if let Some(w) = own {
        match w.push(task) {
            Ok(()) => return,
            Err(t) => task = t,
        }
    }

    // A retiring target refuses the task; pick again among the rest.
    loop {
        let target = {
            let workers = match inner.workers.read() {
                Ok(w) => w,
                Err(p) => p.into_inner(),
            };
            if workers.is_empty() {
                debug!("no live workers, dropping task");
                return;
            }
            let idx = rand::thread_rng().gen_range(0..workers.len());
            workers[idx].clone()
        };
        match target.push(task) {
            Ok(()) => return,
            Err(t) => task = t,
        }
        if inner.stopping.load(Ordering::Acquire) {
            return;
        }
        thread::yield_now();
    }
}

fn pending(inner: &Inner) -> usize {
    let workers = match inner.workers.read() {
        Ok(w) => w,
        Err(p) => p.into_inner(),
    };
    workers.iter().map(|w| w.len()).sum()
}

fn spawn_worker(inner: &Arc<Inner>) -> std::io::Result<()> {
    let id = inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
    let worker = Arc::new(Worker::new(id));
    let pool = inner.clone();
    let me = worker.clone();
    let handle = thread::Builder::new()
        .name(format!("etude-worker-{id}"))
        .spawn(move || run_worker(&pool, me))?;

    match inner.workers.write() {
        Ok(mut w) => w.push(worker),
        Err(p) => p.into_inner().push(worker),
    }
    lock(&inner.handles).push(handle);
    Ok(())
}

fn run_worker(inner: &Inner, me: Arc<Worker>) {
    CURRENT.with(|c| *c.borrow_mut() = Some((inner.id, me.clone())));

    loop {
        if inner.stopping.load(Ordering::Acquire) {
            break;
        }
        if !me.should_run.load(Ordering::Acquire) {
            hand_back(inner, &me);
            break;
        }

        if let Some(task) = me.pop().or_else(|| steal(inner, &me)) {
            run_task(task);
            continue;
        }

        let q = lock(&me.queue);
        if q.is_empty() && me.should_run.load(Ordering::Acquire) && !inner.stopping.load(Ordering::Acquire) {
            let _ = me.cond.wait_timeout(q, STEAL_BACKOFF);
        }
    }

    CURRENT.with(|c| *c.borrow_mut() = None);
    debug!(worker = me.id, "worker exited");
}

/// Takes the coldest task of a random victim without ever blocking on its
/// lock.
fn steal(inner: &Inner, me: &Worker) -> Option<Task> {
    let mut victims: Vec<Arc<Worker>> = {
        let workers = match inner.workers.read() {
            Ok(w) => w,
            Err(p) => p.into_inner(),
        };
        workers.iter().filter(|w| w.id != me.id).cloned().collect()
    };
    victims.shuffle(&mut rand::thread_rng());

    for victim in victims {
        let mut q = match victim.queue.try_lock() {
            Ok(q) => q,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => continue,
        };
        if let Some(task) = q.pop_back() {
            return Some(task);
        }
    }
    None
}

/// A retiring worker gives its queued tasks to the rest of the pool.
fn hand_back(inner: &Inner, me: &Worker) {
    let leftovers: Vec<Task> = lock(&me.queue).drain(..).collect();
    if leftovers.is_empty() {
        return;
    }
    debug!(worker = me.id, count = leftovers.len(), "re-queueing tasks of retiring worker");
    for task in leftovers {
        submit(inner, task);
    }
}

fn run_task(task: Task) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
        let msg = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("non-string panic payload");
        error!(panic = msg, "task panicked");
    }
}

/// Size change for one supervisor tick: positive grows, negative shrinks.
fn plan_resize(total: usize, workers: usize, min: usize, max: usize) -> isize {
    if total > workers && workers < max {
        return (total - workers).min(max - workers) as isize;
    }
    if total < workers / 2 && workers > min {
        let by = (workers / 2).saturating_sub(total.max(min));
        let by = by.min(workers - min);
        return -(by as isize);
    }
    0
}

fn supervise(inner: &Arc<Inner>) {
    let interval = inner.config.idle_interval;
    loop {
        {
            let g = lock(&inner.supervisor_lock);
            if inner.stopping.load(Ordering::Acquire) {
                break;
            }
            let _ = inner.supervisor_cond.wait_timeout(g, interval);
        }
        if inner.stopping.load(Ordering::Acquire) {
            break;
        }

        reap_finished(inner);

        let total = pending(inner);
        let workers = match inner.workers.read() {
            Ok(w) => w.len(),
            Err(p) => p.into_inner().len(),
        };
        let delta = plan_resize(total, workers, inner.config.min, inner.config.max);

        if delta > 0 {
            let mut added = 0;
            for _ in 0..delta {
                if let Err(e) = spawn_worker(inner) {
                    warn!(error = %e, "failed to spawn worker");
                    break;
                }
                added += 1;
            }
            info!(pending = total, from = workers, to = workers + added, "worker pool grown");
        } else if delta < 0 {
            let retired: Vec<Arc<Worker>> = {
                let mut w = match inner.workers.write() {
                    Ok(w) => w,
                    Err(p) => p.into_inner(),
                };
                let keep = w.len().saturating_sub(delta.unsigned_abs()).max(inner.config.min);
                w.split_off(keep)
            };
            for w in &retired {
                w.retire();
            }
            info!(pending = total, from = workers, to = workers - retired.len(), "worker pool shrunk");
        }
    }
}

/// Joins threads of workers that already retired.
fn reap_finished(inner: &Inner) {
    let finished: Vec<JoinHandle<()>> = {
        let mut handles = lock(&inner.handles);
        let (done, live): (Vec<_>, Vec<_>) = handles.drain(..).partition(|h| h.is_finished());
        *handles = live;
        done
    };
    for h in finished {
        let _ = h.join();
    }
}
