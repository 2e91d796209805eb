//! The completion worker pool.
//!
//! AIO callbacks never run on provider I/O paths; `finish` hands the AIO
//! to this pool and one of its threads invokes the callback. A single
//! global pool serves the whole process.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::thread;

use super::Aio;

pub(crate) struct TaskPool {
    mx: Mutex<VecDeque<Aio>>,
    cv: Condvar,
}

impl TaskPool {
    /// Creates the pool and its worker threads. Workers live for the
    /// life of the process.
    pub(crate) fn start() -> TaskPool {
        let pool = TaskPool {
            mx: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        };
        for idx in 0..num_cpus::get().clamp(2, 8) {
            thread::Builder::new()
                .name(format!("braid-task-{}", idx))
                .spawn(worker)
                .expect("spawn task worker");
        }
        pool
    }

    pub(crate) fn dispatch(&self, aio: Aio) {
        let mut q = self.mx.lock().unwrap();
        q.push_back(aio);
        drop(q);
        self.cv.notify_one();
    }

    fn pop(&self) -> Aio {
        let mut q = self.mx.lock().unwrap();
        loop {
            if let Some(aio) = q.pop_front() {
                return aio;
            }
            q = self.cv.wait(q).unwrap();
        }
    }
}

fn worker() {
    loop {
        let aio = super::global_tasks().pop();
        aio.run_callback();
    }
}
