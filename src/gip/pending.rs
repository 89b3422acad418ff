use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

/// The settled value of a [`PendingResult`] together with every error line
/// accumulated while producing it. `errors` is empty on success.
#[derive(Debug, Clone, Default)]
pub struct Outcome<T> {
    pub value: T,
    pub errors: Vec<String>,
}

impl<T> Outcome<T> {
    pub fn ok(value: T) -> Self {
        Outcome {
            value,
            errors: Vec::new(),
        }
    }

    pub fn with_errors(value: T, errors: Vec<String>) -> Self {
        Outcome { value, errors }
    }
}

type Probe = Box<dyn Fn() -> bool + Send + Sync>;
type Producer<T> = Box<dyn FnOnce() -> Outcome<T> + Send>;

struct Callbacks<T> {
    on_success: Option<Box<dyn FnOnce(T) + Send>>,
    on_error: Option<Box<dyn FnOnce(Vec<String>) + Send>>,
    on_always: Option<Box<dyn FnOnce(Outcome<T>) + Send>>,
}

struct ProduceState<T> {
    producer: Option<Producer<T>>,
    outcome: Option<Outcome<T>>,
}

struct CallbackState<T> {
    queue: Vec<Callbacks<T>>,
    waiter_spawned: bool,
    settled: bool,
}

struct Inner<T> {
    probe: Probe,
    done: AtomicBool,
    // Two independent locks: `produce` serialises value materialisation,
    // `callbacks` guards registration against the waiter thread's drain.
    // Neither is ever held while taking the other across instances.
    produce: Mutex<ProduceState<T>>,
    callbacks: Mutex<CallbackState<T>>,
}

/// A single-assignment result that may not have been computed yet.
///
/// The producer runs at most once no matter how many threads call
/// [`get_result`](Self::get_result) or how many callbacks are registered.
/// Once it has run, [`has_result`](Self::has_result) reports true forever.
pub struct PendingResult<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for PendingResult<T> {
    fn clone(&self) -> Self {
        PendingResult {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: Clone + Send + 'static> PendingResult<T> {
    pub fn new<P, F>(probe: P, producer: F) -> Self
    where
        P: Fn() -> bool + Send + Sync + 'static,
        F: FnOnce() -> Outcome<T> + Send + 'static,
    {
        PendingResult {
            inner: Arc::new(Inner {
                probe: Box::new(probe),
                done: AtomicBool::new(false),
                produce: Mutex::new(ProduceState {
                    producer: Some(Box::new(producer)),
                    outcome: None,
                }),
                callbacks: Mutex::new(CallbackState {
                    queue: Vec::new(),
                    waiter_spawned: false,
                    settled: false,
                }),
            }),
        }
    }

    /// An already-settled result.
    pub fn constant(value: T) -> Self {
        Self::from_outcome(Outcome::ok(value))
    }

    pub fn from_outcome(outcome: Outcome<T>) -> Self {
        PendingResult {
            inner: Arc::new(Inner {
                probe: Box::new(|| true),
                done: AtomicBool::new(true),
                produce: Mutex::new(ProduceState {
                    producer: None,
                    outcome: Some(outcome),
                }),
                callbacks: Mutex::new(CallbackState {
                    queue: Vec::new(),
                    waiter_spawned: false,
                    settled: true,
                }),
            }),
        }
    }

    /// True once the value is available. Never blocks.
    pub fn has_result(&self) -> bool {
        self.inner.done.load(Ordering::Acquire) || (self.inner.probe)()
    }

    /// Blocks until the value has been produced and returns it. Concurrent
    /// callers serialise on the production lock; the producer runs once and
    /// later callers get the cached outcome.
    pub fn outcome(&self) -> Outcome<T> {
        let mut state = lock(&self.inner.produce);
        if let Some(outcome) = &state.outcome {
            return outcome.clone();
        }
        let producer = state
            .producer
            .take()
            .expect("value producer present until an outcome is recorded");
        let outcome = producer();
        state.outcome = Some(outcome.clone());
        self.inner.done.store(true, Ordering::Release);
        outcome
    }

    pub fn get_result(&self) -> T {
        self.outcome().value
    }

    pub fn get_errors(&self) -> Vec<String> {
        self.outcome().errors
    }

    /// Registers a callback fired with the value when production succeeds
    /// with no accumulated errors.
    pub fn on_complete<F>(&self, on_success: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.register(Callbacks {
            on_success: Some(Box::new(on_success)),
            on_error: None,
            on_always: None,
        });
    }

    /// Registers a success callback and an error callback; exactly one of
    /// the two fires, depending on whether any errors accumulated.
    pub fn on_complete_or_error<S, E>(&self, on_success: S, on_error: E)
    where
        S: FnOnce(T) + Send + 'static,
        E: FnOnce(Vec<String>) + Send + 'static,
    {
        self.register(Callbacks {
            on_success: Some(Box::new(on_success)),
            on_error: Some(Box::new(on_error)),
            on_always: None,
        });
    }

    /// Registers a callback fired with the full outcome once settled,
    /// success or not.
    pub fn on_settled<F>(&self, on_always: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        self.register(Callbacks {
            on_success: None,
            on_error: None,
            on_always: Some(Box::new(on_always)),
        });
    }

    fn register(&self, callbacks: Callbacks<T>) {
        {
            let mut state = lock(&self.inner.callbacks);
            if !state.settled {
                state.queue.push(callbacks);
                if !state.waiter_spawned {
                    state.waiter_spawned = true;
                    let waiter = self.clone();
                    thread::spawn(move || waiter.run_waiter());
                }
                return;
            }
        }
        // Already settled: the outcome is cached, dispatch immediately.
        dispatch(callbacks, &self.outcome());
    }

    fn run_waiter(&self) {
        let outcome = self.outcome();
        let drained = {
            let mut state = lock(&self.inner.callbacks);
            state.settled = true;
            std::mem::take(&mut state.queue)
        };
        for callbacks in drained {
            dispatch(callbacks, &outcome);
        }
    }

    /// A new result that lazily applies `trans` to the eventual value.
    /// Errors pass through unchanged.
    pub fn translate<U, F>(&self, trans: F) -> PendingResult<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.translate_outcome(move |outcome| Outcome {
            value: trans(outcome.value),
            errors: outcome.errors,
        })
    }

    /// Like [`translate`](Self::translate) but the transform sees and may
    /// extend the accumulated errors.
    pub fn translate_outcome<U, F>(&self, trans: F) -> PendingResult<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Outcome<T>) -> Outcome<U> + Send + 'static,
    {
        let ready = self.clone();
        let source = self.clone();
        PendingResult::new(move || ready.has_result(), move || trans(source.outcome()))
    }

    /// Monadic chaining: `tonext` itself returns a pending result. The
    /// composite is ready only once both stages are, and accumulates the
    /// errors of both.
    pub fn then<U, F>(&self, tonext: F) -> PendingResult<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> PendingResult<U> + Send + 'static,
    {
        let staged: PendingResult<PendingResult<U>> = self.translate(tonext);
        let ready = staged.clone();
        PendingResult::new(
            move || ready.has_result() && ready.get_result().has_result(),
            move || {
                let outer = staged.outcome();
                let inner = outer.value.outcome();
                let mut errors = outer.errors;
                errors.extend(inner.errors);
                Outcome {
                    value: inner.value,
                    errors,
                }
            },
        )
    }

    /// Waits for every named entry and collects the resolved values, with
    /// errors accumulated across all of them.
    pub fn all(entries: Vec<(String, PendingResult<T>)>) -> PendingResult<BTreeMap<String, T>> {
        let probes: Vec<PendingResult<T>> =
            entries.iter().map(|(_, result)| result.clone()).collect();
        PendingResult::new(
            move || probes.iter().all(PendingResult::has_result),
            move || {
                let mut values = BTreeMap::new();
                let mut errors = Vec::new();
                for (name, result) in entries {
                    let outcome = result.outcome();
                    values.insert(name, outcome.value);
                    errors.extend(outcome.errors);
                }
                Outcome {
                    value: values,
                    errors,
                }
            },
        )
    }
}

fn dispatch<T: Clone>(callbacks: Callbacks<T>, outcome: &Outcome<T>) {
    if outcome.errors.is_empty() {
        if let Some(on_success) = callbacks.on_success {
            on_success(outcome.value.clone());
        }
    } else if let Some(on_error) = callbacks.on_error {
        on_error(outcome.errors.clone());
    }
    if let Some(on_always) = callbacks.on_always {
        on_always(outcome.clone());
    }
}
