//! Read-ahead pipeline stage over any iterator.
//!
//! # Design
//!
//! [`ReadAhead`] runs an upstream iterator on its own thread, pushing each
//! item through an optional merge transform and a filter chain into a small
//! evicting buffer. The consumer blocks on a condvar rather than polling, so
//! an idle consumer burns no CPU while the producer works ahead of it.
//!
//! The buffer is circular with a default capacity of one: when the producer
//! outruns the consumer the oldest buffered item is evicted. That suits the
//! intended use, keeping the *latest* merged result warm for a consumer that
//! inspects the head repeatedly, not lossless streaming of a fast producer.
//!
//! Two consumption modes exist. *Streaming* hands items out as they arrive.
//! *Non-streaming* first waits for the upstream to finish, so the buffer
//! holds the final merged state before the consumer sees anything.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace};

// ==== Configuration ====

/// Tuning for a [`ReadAhead`] stage.
#[derive(Debug, Clone)]
pub struct ReadAheadConfig {
    /// Hand items out as they arrive, instead of after upstream exhaustion.
    pub streaming: bool,
    /// Evicting-buffer capacity.
    pub capacity: usize,
}

impl Default for ReadAheadConfig {
    fn default() -> Self {
        Self {
            streaming: true,
            capacity: 1,
        }
    }
}

/// Transform applied to each upstream item before filtering.
pub type MergeFn<T> = Box<dyn FnMut(T) -> T + Send>;

/// Predicate an item must pass to reach the buffer.
pub type FilterFn<T> = Box<dyn Fn(&T) -> bool + Send>;

// ==== Shared state ====

struct State<T> {
    buf: VecDeque<T>,
    capacity: usize,
    /// Producer still permitted to run; cleared by `close`.
    running: bool,
    /// Producer finished, normally or via close.
    finished: bool,
    closed: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

impl<T> Inner<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.state.lock().expect("read-ahead mutex poisoned")
    }
}

// ==== Stage ====

/// Background-filling, condvar-signalled buffer over an upstream iterator.
pub struct ReadAhead<T> {
    inner: Arc<Inner<T>>,
    streaming: bool,
    worker: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> ReadAhead<T> {
    /// Spawns the producer thread over `upstream`.
    ///
    /// # Panics
    ///
    /// Panics if `config.capacity` is zero.
    pub fn new<I>(
        upstream: I,
        merge: Option<MergeFn<T>>,
        filters: Vec<FilterFn<T>>,
        config: ReadAheadConfig,
    ) -> Self
    where
        I: Iterator<Item = T> + Send + 'static,
    {
        assert!(config.capacity > 0, "read-ahead capacity must be nonzero");
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                buf: VecDeque::with_capacity(config.capacity),
                capacity: config.capacity,
                running: true,
                finished: false,
                closed: false,
            }),
            cond: Condvar::new(),
        });
        let worker = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("rangescan-readahead".into())
                .spawn(move || produce(inner, upstream, merge, filters))
                .expect("failed to spawn read-ahead thread")
        };
        Self {
            inner,
            streaming: config.streaming,
            worker: Some(worker),
        }
    }

    /// Whether an item is available, blocking while the producer may still
    /// deliver one.
    ///
    /// In non-streaming mode this first waits for the upstream to finish.
    /// A buffered final item stays visible until consumed, even after the
    /// upstream ends or the stage is closed.
    pub fn has_next(&self) -> bool {
        let mut state = self.inner.lock();
        if !self.streaming {
            while !state.finished && !state.closed {
                state = self
                    .inner
                    .cond
                    .wait(state)
                    .expect("read-ahead mutex poisoned");
            }
        }
        while state.buf.is_empty() && !state.finished && !state.closed {
            state = self
                .inner
                .cond
                .wait(state)
                .expect("read-ahead mutex poisoned");
        }
        !state.buf.is_empty()
    }

    /// Takes the next buffered item, blocking as [`has_next`] does.
    ///
    /// [`has_next`]: ReadAhead::has_next
    pub fn next_item(&self) -> Option<T> {
        if !self.has_next() {
            return None;
        }
        let mut state = self.inner.lock();
        state.buf.pop_front()
    }

    /// Stops the producer without discarding buffered items.
    ///
    /// Does not interrupt an in-flight upstream fetch; the producer exits
    /// before starting the next one. Consumers blocked in `has_next` wake.
    pub fn close(&self) {
        let mut state = self.inner.lock();
        state.running = false;
        state.closed = true;
        self.inner.cond.notify_all();
        debug!("read-ahead closed");
    }
}

impl<T: Send + 'static> Iterator for ReadAhead<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.next_item()
    }
}

impl<T> Drop for ReadAhead<T> {
    fn drop(&mut self) {
        {
            let mut state = self.inner.lock();
            state.running = false;
            state.closed = true;
            self.inner.cond.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn produce<T, I>(
    inner: Arc<Inner<T>>,
    upstream: I,
    mut merge: Option<MergeFn<T>>,
    filters: Vec<FilterFn<T>>,
) where
    I: Iterator<Item = T>,
{
    for item in upstream {
        if !inner.lock().running {
            break;
        }
        let item = match merge.as_mut() {
            Some(merge) => merge(item),
            None => item,
        };
        if !filters.iter().all(|f| f(&item)) {
            trace!("read-ahead item filtered");
            continue;
        }
        let mut state = inner.lock();
        if state.buf.len() == state.capacity {
            // Evict the oldest so the freshest merged item wins.
            state.buf.pop_front();
            trace!("read-ahead evicted stale item");
        }
        state.buf.push_back(item);
        inner.cond.notify_all();
    }
    let mut state = inner.lock();
    state.finished = true;
    state.running = false;
    inner.cond.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn stage<I>(upstream: I, config: ReadAheadConfig) -> ReadAhead<i64>
    where
        I: Iterator<Item = i64> + Send + 'static,
    {
        ReadAhead::new(upstream, None, Vec::new(), config)
    }

    #[test]
    fn streams_items_through() {
        let stage = stage(
            1..=5,
            ReadAheadConfig {
                capacity: 16,
                ..ReadAheadConfig::default()
            },
        );
        let items: Vec<i64> = stage.collect();
        assert_eq!(items, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn merge_and_filters_apply_in_order() {
        let stage = ReadAhead::new(
            1..=6,
            Some(Box::new(|x: i64| x * 10) as MergeFn<i64>),
            vec![Box::new(|x: &i64| x % 20 == 0) as FilterFn<i64>],
            ReadAheadConfig {
                capacity: 16,
                ..ReadAheadConfig::default()
            },
        );
        let items: Vec<i64> = stage.collect();
        assert_eq!(items, [20, 40, 60]);
    }

    #[test]
    fn capacity_one_buffer_keeps_the_latest_item() {
        // Producer runs to completion before the consumer looks: with a
        // one-slot evicting buffer only the final item survives.
        let stage = stage(1..=100, ReadAheadConfig::default());
        thread::sleep(Duration::from_millis(100));
        assert!(stage.has_next());
        assert_eq!(stage.next_item(), Some(100));
        assert!(!stage.has_next());
    }

    #[test]
    fn non_streaming_waits_for_upstream_exhaustion() {
        let (tx, rx) = mpsc::channel::<i64>();
        let stage = stage(
            rx.into_iter(),
            ReadAheadConfig {
                streaming: false,
                capacity: 4,
            },
        );
        let probe = {
            thread::spawn(move || {
                for i in 1..=3 {
                    tx.send(i).expect("stage producer alive");
                    thread::sleep(Duration::from_millis(20));
                }
                // Dropping tx ends the upstream.
            })
        };
        // has_next blocks until the sender is dropped, then the buffered
        // items are all present.
        assert!(stage.has_next());
        probe.join().expect("sender thread panicked");
        let items: Vec<i64> = std::iter::from_fn(|| stage.next_item()).collect();
        assert_eq!(items, [1, 2, 3]);
    }

    #[test]
    fn non_streaming_fold_merge_yields_the_folded_result() {
        // One-slot buffer plus a running-sum merge: non-streaming consumers
        // see only the final fold.
        let mut total = 0i64;
        let stage = ReadAhead::new(
            1..=10,
            Some(Box::new(move |x: i64| {
                total += x;
                total
            }) as MergeFn<i64>),
            Vec::new(),
            ReadAheadConfig {
                streaming: false,
                capacity: 1,
            },
        );
        assert!(stage.has_next());
        assert_eq!(stage.next_item(), Some(55));
        assert!(!stage.has_next());
    }

    #[test]
    fn final_item_stays_visible_after_end_of_stream() {
        let stage = stage(std::iter::once(42), ReadAheadConfig::default());
        assert!(stage.has_next());
        // Still there until consumed.
        assert!(stage.has_next());
        assert_eq!(stage.next_item(), Some(42));
        assert!(!stage.has_next());
    }

    #[test]
    fn close_wakes_a_blocked_consumer() {
        let (tx, rx) = mpsc::channel::<i64>();
        let stage = Arc::new(stage(rx.into_iter(), ReadAheadConfig::default()));
        let consumer = {
            let stage = Arc::clone(&stage);
            thread::spawn(move || stage.has_next())
        };
        thread::sleep(Duration::from_millis(50));
        stage.close();
        assert!(!consumer.join().expect("consumer panicked"));
        drop(tx);
    }

    #[test]
    fn buffered_items_survive_close() {
        let stage = stage(std::iter::once(7), ReadAheadConfig::default());
        assert!(stage.has_next());
        stage.close();
        assert_eq!(stage.next_item(), Some(7));
        assert!(!stage.has_next());
    }
}
