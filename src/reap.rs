//! Deferred destruction.
//!
//! Objects that may outlive their nominal owner (pipes, TLS
//! configurations) are torn down on a dedicated reap thread, never under
//! a caller's lock. Callbacks can therefore hold a transient reference
//! and release it after returning without racing destruction.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, OnceLock};
use std::thread;

type Chore = Box<dyn FnOnce() + Send>;

struct Reaper {
    mx: Mutex<VecDeque<Chore>>,
    cv: Condvar,
}

fn reaper() -> &'static Reaper {
    static REAPER: OnceLock<Reaper> = OnceLock::new();
    REAPER.get_or_init(|| {
        thread::Builder::new()
            .name("braid-reap".into())
            .spawn(run)
            .expect("spawn reap thread");
        Reaper {
            mx: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        }
    })
}

/// Defers `chore` to the reap thread.
pub(crate) fn reap<F>(chore: F)
where
    F: FnOnce() + Send + 'static,
{
    let r = reaper();
    let mut q = r.mx.lock().unwrap();
    q.push_back(Box::new(chore));
    drop(q);
    r.cv.notify_one();
}

fn run() {
    let r = reaper();
    loop {
        let chore = {
            let mut q = r.mx.lock().unwrap();
            loop {
                if let Some(c) = q.pop_front() {
                    break c;
                }
                q = r.cv.wait(q).unwrap();
            }
        };
        chore();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn chores_run_off_thread() {
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        let caller = thread::current().id();
        reap(move || {
            assert_ne!(thread::current().id(), caller);
            d.store(true, Ordering::SeqCst);
        });
        for _ in 0..100 {
            if done.load(Ordering::SeqCst) {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("reap chore never ran");
    }
}
