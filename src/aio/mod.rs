//! Asynchronous I/O operation objects.
//!
//! An [`Aio`] represents one outstanding operation: a send, a receive, a
//! dial, an accept, a sleep. The caller allocates it once with a
//! completion callback and then submits it to providers (streams, pipes,
//! endpoints). Exactly one provider owns the AIO between `begin`/`schedule`
//! and `finish`; completion dispatches the callback on a worker thread,
//! never inline on the provider's I/O path.
//!
//! Cancellation and timeouts run through a single mechanism: the provider
//! installs a cancel function when it schedules the operation, and
//! whoever needs to end the operation early (an `abort`, an expiration
//! scan, a queue shutdown) takes that function — exactly once — and
//! invokes it outside every AIO lock. The cancel function removes the AIO
//! from the provider's queue and finishes it.

pub(crate) mod expire;
pub(crate) mod task;

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::msg::Message;

use self::expire::Expirer;
use self::task::TaskPool;

/// Maximum number of transmit segments an AIO may carry.
pub(crate) const MAX_IOV: usize = 8;

/// Number of opaque input/output slots.
const NUM_SLOTS: usize = 4;

/// Expired AIOs are handed to cancel functions with `Ok(())` when the
/// operation treats expiry as success (sleep), otherwise `Err(TimedOut)`.
pub(crate) type CancelFn = Box<dyn FnOnce(&Aio, Result<()>) + Send>;

/// Completion callback. Runs once per completed operation, on a worker
/// thread (or on the finishing thread for `finish_sync`).
pub type AioCallback = Box<dyn Fn(&Aio) + Send + Sync>;

/// A one-shot asynchronous operation record.
///
/// Clones share the same underlying operation; the handle is cheap to
/// clone and safe to use from any thread.
#[derive(Clone)]
pub struct Aio {
    inner: Arc<AioInner>,
}

struct AioInner {
    st: Mutex<State>,
    cv: Condvar,
    cb: AioCallback,
    expirer: Arc<Expirer>,
    /// Expiration shard, chosen pseudo-randomly at init and never moved.
    shard: usize,
}

struct State {
    /// A provider holds the operation (between begin and finish).
    busy: bool,
    /// Completion callbacks dispatched and not yet returned.
    task_pending: u32,
    /// Stop or close was requested; all future begins fail.
    stopping: bool,
    /// Abort requested before a provider engaged; next begin fails with it.
    aborted: Option<Error>,
    /// Sleep operation in flight.
    sleeping: bool,
    /// Expiry completes the operation successfully instead of TimedOut.
    expire_ok: bool,
    /// The AIO sits on its expiration shard's list.
    on_expire_list: bool,
    /// An expiration scan is invoking the cancel function.
    expiring: bool,

    cancel: Option<CancelFn>,
    timeout: Option<Duration>,

    result: Result<()>,
    count: usize,
    msg: Option<Message>,
    tx: Vec<Bytes>,
    rx: Option<(BytesMut, usize)>,
    inputs: [Option<Box<dyn Any + Send>>; NUM_SLOTS],
    outputs: [Option<Box<dyn Any + Send>>; NUM_SLOTS],
}

impl Default for State {
    fn default() -> State {
        State {
            busy: false,
            task_pending: 0,
            stopping: false,
            aborted: None,
            sleeping: false,
            expire_ok: false,
            on_expire_list: false,
            expiring: false,
            cancel: None,
            timeout: None,
            result: Ok(()),
            count: 0,
            msg: None,
            tx: Vec::new(),
            rx: None,
            inputs: Default::default(),
            outputs: Default::default(),
        }
    }
}

fn global_expirer() -> Arc<Expirer> {
    static EXPIRER: OnceLock<Arc<Expirer>> = OnceLock::new();
    EXPIRER
        .get_or_init(|| {
            let expirer = Arc::new(Expirer::new(expire::default_shards()));
            expirer.spawn_threads();
            expirer
        })
        .clone()
}

fn global_tasks() -> &'static TaskPool {
    static TASKS: OnceLock<TaskPool> = OnceLock::new();
    TASKS.get_or_init(TaskPool::start)
}

impl Aio {
    /// Creates an AIO with the given completion callback.
    pub fn new<F>(callback: F) -> Aio
    where
        F: Fn(&Aio) + Send + Sync + 'static,
    {
        Aio::with_expirer(Box::new(callback), global_expirer())
    }

    /// Creates an AIO whose completion nobody watches; used by synchronous
    /// wrappers that block on [`Aio::wait`] instead.
    pub(crate) fn silent() -> Aio {
        Aio::new(|_| ())
    }

    pub(crate) fn with_expirer(cb: AioCallback, expirer: Arc<Expirer>) -> Aio {
        let shard = rand::random::<u64>() as usize % expirer.shards();
        Aio {
            inner: Arc::new(AioInner {
                st: Mutex::new(State::default()),
                cv: Condvar::new(),
                cb,
                expirer,
                shard,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.st.lock().unwrap()
    }

    // ---- caller-side surface -------------------------------------------

    /// Sets the timeout applied to subsequently started operations.
    /// `None` means no timeout.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.lock().timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.lock().timeout
    }

    /// Clears result, count, and the opaque slots ahead of a new use.
    pub fn reset(&self) {
        let mut st = self.lock();
        debug_assert!(!st.busy, "reset of an active aio");
        st.result = Ok(());
        st.count = 0;
        st.tx.clear();
        st.rx = None;
        st.inputs = Default::default();
        st.outputs = Default::default();
    }

    /// The result of the most recent completed operation.
    pub fn result(&self) -> Result<()> {
        self.lock().result
    }

    /// Bytes transferred by the most recent completed operation.
    pub fn count(&self) -> usize {
        self.lock().count
    }

    /// Attaches a message for a send operation.
    pub fn set_msg(&self, msg: Message) {
        self.lock().msg = Some(msg);
    }

    /// Takes the attached message, if any (a received message after a
    /// recv completion, or an unsent one after a failed send).
    pub fn take_msg(&self) -> Option<Message> {
        self.lock().msg.take()
    }

    /// Stores an opaque input for the provider. Panics if `index > 3`.
    pub fn set_input<T: Any + Send>(&self, index: usize, value: T) {
        assert!(index < NUM_SLOTS, "aio input index out of range");
        self.lock().inputs[index] = Some(Box::new(value));
    }

    /// Takes an opaque input. `None` if absent or of a different type.
    pub fn take_input<T: Any + Send>(&self, index: usize) -> Option<T> {
        assert!(index < NUM_SLOTS, "aio input index out of range");
        let boxed = self.lock().inputs[index].take()?;
        match boxed.downcast::<T>() {
            Ok(v) => Some(*v),
            Err(_) => None,
        }
    }

    /// Stores an opaque output for the caller. Panics if `index > 3`.
    pub(crate) fn set_output<T: Any + Send>(&self, index: usize, value: T) {
        assert!(index < NUM_SLOTS, "aio output index out of range");
        self.lock().outputs[index] = Some(Box::new(value));
    }

    /// Takes an opaque output produced by the completed operation.
    pub fn take_output<T: Any + Send>(&self, index: usize) -> Option<T> {
        assert!(index < NUM_SLOTS, "aio output index out of range");
        let boxed = self.lock().outputs[index].take()?;
        match boxed.downcast::<T>() {
            Ok(v) => Some(*v),
            Err(_) => None,
        }
    }

    /// Aborts the pending operation with `err`. The provider's cancel
    /// function runs on this thread, outside the AIO lock. If no provider
    /// is engaged, the next begin fails with `err`.
    pub fn abort(&self, err: Error) {
        let cancel = {
            let mut st = self.lock();
            if !st.busy {
                st.aborted = Some(err);
                None
            } else {
                st.cancel.take()
            }
        };
        if let Some(cancel) = cancel {
            cancel(self, Err(err));
        }
    }

    /// Like `abort(Stopped)`, and permanently: future begins fail with
    /// `Stopped`. Does not wait for the callback to drain.
    pub fn close(&self) {
        self.lock().stopping = true;
        self.abort(Error::Stopped);
    }

    /// Closes the AIO and waits until any in-flight operation and its
    /// callback have fully drained.
    pub fn stop(&self) {
        self.close();
        self.wait();
    }

    /// Blocks until no operation is outstanding and any dispatched
    /// callback has returned. Must not be called from the callback.
    pub fn wait(&self) {
        let mut st = self.lock();
        while st.busy || st.task_pending > 0 {
            st = self.inner.cv.wait(st).unwrap();
        }
    }

    /// Sleeps for `dur`, then completes successfully. A shorter finite
    /// timeout on the AIO wins and completes with `TimedOut`.
    pub fn sleep(&self, dur: Duration) {
        if !self.begin() {
            return;
        }
        let mut st = self.lock();
        let (deadline, expire_ok) = match st.timeout {
            Some(t) if t < dur => (Instant::now() + t, false),
            _ => (Instant::now() + dur, true),
        };
        st.sleeping = true;
        st.expire_ok = expire_ok;
        st.cancel = Some(Box::new(|aio: &Aio, res: Result<()>| {
            aio.finish(res, 0);
        }));
        st.on_expire_list = true;
        self.inner
            .expirer
            .arm(self.inner.shard, deadline, self.clone());
        drop(st);
    }

    // ---- provider-side surface -----------------------------------------

    /// Claims the AIO for a new operation. On failure (stopped, aborted)
    /// the callback is dispatched immediately with the distinguished
    /// result and `begin` returns false; the provider must go no
    /// further. The dispatch goes through the worker pool so a failed
    /// begin never re-enters the caller's locks.
    pub(crate) fn begin(&self) -> bool {
        let mut st = self.lock();
        assert!(!st.busy, "aio restarted while an operation is pending");
        st.result = Ok(());
        st.count = 0;
        st.expire_ok = false;
        st.sleeping = false;
        if st.stopping {
            st.result = Err(Error::Stopped);
            self.dispatch_task(st);
            return false;
        }
        if let Some(rv) = st.aborted.take() {
            st.result = Err(rv);
            self.dispatch_task(st);
            return false;
        }
        st.busy = true;
        true
    }

    /// Installs the cancel function and arms expiration. Safe to call
    /// under the provider's lock. On error the provider owns the
    /// completion: it must release its lock and `finish_error` the AIO
    /// with the returned code.
    pub(crate) fn schedule(&self, cancel: CancelFn) -> Result<()> {
        let mut st = self.lock();
        debug_assert!(st.busy, "schedule without begin");
        if st.stopping {
            return Err(Error::Stopped);
        }
        match st.timeout {
            Some(t) if t.is_zero() => Err(Error::TimedOut),
            Some(t) => {
                st.cancel = Some(cancel);
                st.on_expire_list = true;
                self.inner
                    .expirer
                    .arm(self.inner.shard, Instant::now() + t, self.clone());
                Ok(())
            }
            None => {
                st.cancel = Some(cancel);
                Ok(())
            }
        }
    }

    /// `begin` + `schedule` for providers that hold no lock across
    /// submission. On schedule failure the callback is dispatched
    /// synchronously and `start` returns false.
    pub(crate) fn start(&self, cancel: CancelFn) -> bool {
        if !self.begin() {
            return false;
        }
        match self.schedule(cancel) {
            Ok(()) => true,
            Err(rv) => {
                self.finish_sync(Err(rv), 0);
                false
            }
        }
    }

    /// Completes the operation; the callback is dispatched to a worker.
    pub(crate) fn finish(&self, result: Result<()>, count: usize) {
        self.finish_common(result, count, false);
    }

    /// Completes the operation, running the callback on this thread.
    pub(crate) fn finish_sync(&self, result: Result<()>, count: usize) {
        self.finish_common(result, count, true);
    }

    pub(crate) fn finish_error(&self, err: Error) {
        self.finish_common(Err(err), 0, false);
    }

    /// Attaches a received message and completes successfully with its
    /// length as the count.
    pub(crate) fn finish_msg(&self, msg: Message) {
        let len = msg.len();
        {
            let mut st = self.lock();
            st.msg = Some(msg);
        }
        self.finish_common(Ok(()), len, false);
    }

    fn finish_common(&self, result: Result<()>, count: usize, sync: bool) {
        let mut st = self.lock();
        assert!(st.busy, "aio finished without a pending operation");
        st.busy = false;
        st.sleeping = false;
        st.expiring = false;
        st.cancel = None;
        if st.on_expire_list {
            st.on_expire_list = false;
            self.inner.expirer.disarm(self.inner.shard, self);
        }
        st.result = result;
        st.count = count;
        if sync {
            self.dispatch_sync(st);
        } else {
            st.task_pending += 1;
            drop(st);
            global_tasks().dispatch(self.clone());
        }
    }

    /// Queues the callback on the worker pool.
    fn dispatch_task(&self, mut st: MutexGuard<'_, State>) {
        st.task_pending += 1;
        drop(st);
        global_tasks().dispatch(self.clone());
    }

    /// Runs the callback inline. Takes the state guard to flip
    /// `task_pending` around the call without racing `wait`.
    fn dispatch_sync(&self, mut st: MutexGuard<'_, State>) {
        st.task_pending += 1;
        drop(st);
        (self.inner.cb)(self);
        let mut st = self.lock();
        st.task_pending -= 1;
        drop(st);
        self.inner.cv.notify_all();
    }

    /// Worker entry: run the callback, then release waiters.
    pub(crate) fn run_callback(&self) {
        (self.inner.cb)(self);
        let mut st = self.lock();
        st.task_pending -= 1;
        drop(st);
        self.inner.cv.notify_all();
    }

    /// Expiration-scan entry. `stopped` is set when the shard itself is
    /// shutting down; it overrides `expire_ok`.
    pub(crate) fn expire_fire(&self, stopped: bool) {
        let (cancel, res) = {
            let mut st = self.lock();
            st.on_expire_list = false;
            if !st.busy {
                return;
            }
            let Some(cancel) = st.cancel.take() else {
                return;
            };
            st.expiring = true;
            let res = if stopped {
                Err(Error::Stopped)
            } else if st.expire_ok {
                Ok(())
            } else {
                Err(Error::TimedOut)
            };
            (cancel, res)
        };
        cancel(self, res);
    }

    // ---- transfer buffers ----------------------------------------------

    /// Sets the transmit segments for a send. At most [`MAX_IOV`].
    pub fn set_tx(&self, segs: Vec<Bytes>) {
        assert!(segs.len() <= MAX_IOV, "too many transmit segments");
        self.lock().tx = segs;
    }

    /// Clones the transmit segments (cheap; `Bytes` is refcounted).
    pub fn tx(&self) -> Vec<Bytes> {
        self.lock().tx.clone()
    }

    /// Hands the AIO a receive buffer; providers append until the buffer
    /// holds `want` bytes in total (short reads complete early).
    pub fn set_rx(&self, buf: BytesMut, want: usize) {
        self.lock().rx = Some((buf, want));
    }

    /// Takes back the receive buffer after a completion.
    pub fn take_rx(&self) -> Option<BytesMut> {
        self.lock().rx.take().map(|(buf, _)| buf)
    }

    /// Provider side: borrow the buffer and its target length for the
    /// duration of one read attempt.
    pub(crate) fn take_rx_full(&self) -> Option<(BytesMut, usize)> {
        self.lock().rx.take()
    }

    pub(crate) fn same(&self, other: &Aio) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Aio {
    fn eq(&self, other: &Aio) -> bool {
        self.same(other)
    }
}

impl Eq for Aio {}

impl fmt::Debug for Aio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.lock();
        f.debug_struct("Aio")
            .field("busy", &st.busy)
            .field("sleeping", &st.sleeping)
            .field("expiring", &st.expiring)
            .field("stopping", &st.stopping)
            .field("timeout", &st.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn counting_aio() -> (Aio, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let aio = Aio::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        (aio, hits)
    }

    #[test]
    fn finish_runs_callback_exactly_once() {
        let (aio, hits) = counting_aio();
        assert!(aio.start(Box::new(|a, res| a.finish(res, 0))));
        aio.finish(Ok(()), 7);
        aio.wait();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(aio.count(), 7);
        assert!(aio.result().is_ok());
    }

    #[test]
    fn stop_then_start_fails_stopped() {
        let (aio, hits) = counting_aio();
        aio.stop();
        assert!(!aio.start(Box::new(|a, res| a.finish(res, 0))));
        assert_eq!(aio.result(), Err(Error::Stopped));
        // the failed start still dispatched the callback
        aio.wait();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn abort_before_start_fails_with_value() {
        let (aio, _hits) = counting_aio();
        aio.abort(Error::Canceled);
        assert!(!aio.start(Box::new(|a, res| a.finish(res, 0))));
        assert_eq!(aio.result(), Err(Error::Canceled));
    }

    #[test]
    fn abort_invokes_cancel_fn() {
        let (aio, hits) = counting_aio();
        assert!(aio.start(Box::new(|a, res| a.finish(res, 0))));
        aio.abort(Error::Canceled);
        aio.wait();
        assert_eq!(aio.result(), Err(Error::Canceled));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_timeout_start_times_out() {
        let (aio, _hits) = counting_aio();
        aio.set_timeout(Some(Duration::ZERO));
        assert!(!aio.start(Box::new(|a, res| a.finish(res, 0))));
        assert_eq!(aio.result(), Err(Error::TimedOut));
    }

    #[test]
    fn expiration_fires_cancel_within_window() {
        let (aio, _hits) = counting_aio();
        aio.set_timeout(Some(Duration::from_millis(100)));
        let started = Instant::now();
        assert!(aio.start(Box::new(|a, res| a.finish(res, 0))));
        aio.wait();
        let elapsed = started.elapsed();
        assert_eq!(aio.result(), Err(Error::TimedOut));
        assert!(elapsed >= Duration::from_millis(100), "fired early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(2000), "fired late: {:?}", elapsed);
    }

    #[test]
    fn sleep_completes_ok() {
        let (aio, hits) = counting_aio();
        let started = Instant::now();
        aio.sleep(Duration::from_millis(50));
        aio.wait();
        assert!(aio.result().is_ok());
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sleep_bounded_by_shorter_timeout() {
        let (aio, _hits) = counting_aio();
        aio.set_timeout(Some(Duration::from_millis(30)));
        aio.sleep(Duration::from_secs(10));
        aio.wait();
        assert_eq!(aio.result(), Err(Error::TimedOut));
    }

    #[test]
    fn finish_before_expiry_wins() {
        let (aio, hits) = counting_aio();
        aio.set_timeout(Some(Duration::from_millis(200)));
        assert!(aio.start(Box::new(|a, res| a.finish(res, 0))));
        aio.finish(Ok(()), 1);
        aio.wait();
        assert!(aio.result().is_ok());
        thread::sleep(Duration::from_millis(300));
        // expiry must not fire a second completion
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wait_blocks_until_callback_returns() {
        let gate = Arc::new(AtomicUsize::new(0));
        let g = gate.clone();
        let aio = Aio::new(move |_| {
            thread::sleep(Duration::from_millis(50));
            g.store(1, Ordering::SeqCst);
        });
        assert!(aio.start(Box::new(|a, res| a.finish(res, 0))));
        aio.finish(Ok(()), 0);
        aio.wait();
        assert_eq!(gate.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn message_slot_round_trip() {
        let (aio, _hits) = counting_aio();
        aio.set_msg(Message::from_body(b"hello"));
        let m = aio.take_msg().unwrap();
        assert_eq!(m.body(), b"hello");
        assert!(aio.take_msg().is_none());
    }

    #[test]
    fn input_slot_round_trip() {
        let (aio, _hits) = counting_aio();
        aio.set_input(1, 42u32);
        assert_eq!(aio.take_input::<u32>(1), Some(42));
        assert!(aio.take_input::<u32>(1).is_none());
    }

    #[test]
    fn output_slot_downcast() {
        let (aio, _hits) = counting_aio();
        aio.set_output(0, String::from("stream"));
        assert_eq!(aio.take_output::<String>(0).unwrap(), "stream");
        assert!(aio.take_output::<String>(0).is_none());
    }
}
