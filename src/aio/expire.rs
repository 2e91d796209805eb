//! Sharded expiration queues.
//!
//! Every AIO with a finite timeout is armed on one of N shards; each
//! shard keeps a deadline-ordered list and a dedicated thread that sleeps
//! until the earliest deadline. Expired entries are pulled in small
//! batches under the shard lock and their cancel functions are fired
//! outside it.

use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::Instant;

use super::Aio;

/// Upper bound on expirations handled per scan; keeps the shard lock
/// hold times short under a thundering herd of deadlines.
const EXPIRE_BATCH: usize = 8;

pub(crate) fn default_shards() -> usize {
    num_cpus::get().clamp(1, 8)
}

pub(crate) struct Expirer {
    shards: Box<[Shard]>,
}

struct Shard {
    mx: Mutex<Queue>,
    cv: Condvar,
}

struct Queue {
    /// Ascending by deadline.
    entries: Vec<Entry>,
    stopping: bool,
}

struct Entry {
    deadline: Instant,
    aio: Aio,
}

impl Expirer {
    pub(crate) fn new(nshards: usize) -> Expirer {
        let nshards = nshards.max(1);
        let mut shards = Vec::with_capacity(nshards);
        for _ in 0..nshards {
            shards.push(Shard {
                mx: Mutex::new(Queue {
                    entries: Vec::new(),
                    stopping: false,
                }),
                cv: Condvar::new(),
            });
        }
        Expirer {
            shards: shards.into_boxed_slice(),
        }
    }

    /// Spawns the scan threads. Separate from `new` so the global
    /// instance can hand each thread an `Arc` of itself.
    pub(crate) fn spawn_threads(self: &std::sync::Arc<Self>) {
        for idx in 0..self.shards.len() {
            let me = self.clone();
            thread::Builder::new()
                .name(format!("braid-expire-{}", idx))
                .spawn(move || me.run(idx))
                .expect("spawn expire thread");
        }
    }

    pub(crate) fn shards(&self) -> usize {
        self.shards.len()
    }

    /// Adds an armed AIO. Called with the AIO lock held; the shard lock
    /// nests inside it.
    pub(crate) fn arm(&self, shard: usize, deadline: Instant, aio: Aio) {
        let sh = &self.shards[shard];
        let mut q = sh.mx.lock().unwrap();
        let pos = q
            .entries
            .partition_point(|e| e.deadline <= deadline);
        let wake = pos == 0;
        q.entries.insert(pos, Entry { deadline, aio });
        drop(q);
        if wake {
            sh.cv.notify_one();
        }
    }

    /// Removes an armed AIO if it is still queued. Tolerates absence: a
    /// concurrent scan may have pulled the entry already.
    pub(crate) fn disarm(&self, shard: usize, aio: &Aio) {
        let sh = &self.shards[shard];
        let mut q = sh.mx.lock().unwrap();
        if let Some(pos) = q.entries.iter().position(|e| e.aio.same(aio)) {
            q.entries.remove(pos);
        }
    }

    /// Stops all shards, firing every queued entry with `Stopped`.
    #[cfg(test)]
    pub(crate) fn shutdown(&self) {
        for sh in self.shards.iter() {
            let mut q = sh.mx.lock().unwrap();
            q.stopping = true;
            drop(q);
            sh.cv.notify_all();
        }
    }

    fn run(&self, idx: usize) {
        let sh = &self.shards[idx];
        let mut q = sh.mx.lock().unwrap();
        loop {
            let now = Instant::now();
            let stopping = q.stopping;

            let due = q
                .entries
                .partition_point(|e| stopping || e.deadline <= now);
            if due > 0 {
                let batch: Vec<Aio> = q
                    .entries
                    .drain(..due.min(EXPIRE_BATCH))
                    .map(|e| e.aio)
                    .collect();
                drop(q);
                for aio in batch {
                    aio.expire_fire(stopping);
                }
                q = sh.mx.lock().unwrap();
                continue;
            }

            if stopping {
                break;
            }

            q = match q.entries.first() {
                Some(e) => {
                    let wait = e.deadline.saturating_duration_since(now);
                    sh.cv.wait_timeout(q, wait).unwrap().0
                }
                None => sh.cv.wait(q).unwrap(),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn shard_stop_cancels_entries_with_stopped() {
        let expirer = Arc::new(Expirer::new(1));
        expirer.spawn_threads();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let aio = Aio::with_expirer(Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }), expirer.clone());
        aio.set_timeout(Some(Duration::from_secs(3600)));
        assert!(aio.start(Box::new(|a, res| a.finish(res, 0))));

        expirer.shutdown();
        aio.wait();
        assert_eq!(aio.result(), Err(Error::Stopped));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn entries_fire_in_deadline_order() {
        let expirer = Arc::new(Expirer::new(1));
        expirer.spawn_threads();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut aios = Vec::new();
        for (tag, ms) in [(2u32, 80u64), (1, 40), (3, 120)] {
            let ord = order.clone();
            let aio = Aio::with_expirer(
                Box::new(move |_| ord.lock().unwrap().push(tag)),
                expirer.clone(),
            );
            aio.set_timeout(Some(Duration::from_millis(ms)));
            assert!(aio.start(Box::new(|a, res| a.finish(res, 0))));
            aios.push(aio);
        }
        for aio in &aios {
            aio.wait();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }
}
