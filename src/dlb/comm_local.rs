//! In-process communication backend: one OS thread per worker.
//!
//! Workers share nothing but their mailboxes. A message carries the
//! context id of the communicator it was sent on, its sender's rank inside
//! that communicator, and a tag; a receive takes the oldest matching
//! message. Sends never block, so every worker can post its sends before
//! receiving, as the engine's collectives require.
//!
//! ```ignore
//! let sums = LocalUniverse::run(4, |comm| comm.reduce_sum_f32(0, comm.rank() as f32))?;
//! assert_eq!(sums[0], Some(6.0));
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use super::comm::{Communicator, Tag};
use crate::error::{DlbError, Result};
use crate::protocol_error;

struct Envelope {
    context: u64,
    source: usize,
    tag: Tag,
    payload: Vec<u8>,
}

#[derive(Default)]
struct Mailbox {
    queue: Mutex<VecDeque<Envelope>>,
    arrived: Condvar,
}

struct Shared {
    mailboxes: Vec<Mailbox>,
    next_context: AtomicU64,
    aborted: AtomicBool,
    failed_rank: Mutex<Option<usize>>,
}

impl Shared {
    fn new(workers: usize) -> Self {
        Self {
            mailboxes: (0..workers).map(|_| Mailbox::default()).collect(),
            next_context: AtomicU64::new(1),
            aborted: AtomicBool::new(false),
            failed_rank: Mutex::new(None),
        }
    }

    /// Wake every blocked worker so it can observe the failure of `rank`.
    fn abort(&self, rank: usize) {
        if let Ok(mut failed) = self.failed_rank.lock() {
            failed.get_or_insert(rank);
        }
        self.aborted.store(true, Ordering::Release);
        for mailbox in &self.mailboxes {
            // Taking the lock orders the flag store before any waiter re-checks it.
            let _queue = mailbox.queue.lock();
            mailbox.arrived.notify_all();
        }
    }
}

/// Marks the universe as failed if the owning worker unwinds.
struct AbortOnPanic {
    shared: Arc<Shared>,
    rank: usize,
}

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            self.shared.abort(self.rank);
        }
    }
}

/// Communicator over the workers of a [`LocalUniverse`].
pub struct LocalComm {
    shared: Arc<Shared>,
    context: u64,
    rank: usize,
    /// Universe index of each member, indexed by rank in this communicator.
    members: Vec<usize>,
}

impl LocalComm {
    fn world(shared: Arc<Shared>, rank: usize, size: usize) -> Self {
        Self {
            shared,
            context: 0,
            rank,
            members: (0..size).collect(),
        }
    }

    fn mailbox_of(&self, rank: usize) -> Result<&Mailbox> {
        let universe_index = *self.members.get(rank).ok_or_else(|| {
            protocol_error!(
                "send",
                "rank {} outside communicator of {}",
                rank,
                self.members.len()
            )
        })?;
        Ok(&self.shared.mailboxes[universe_index])
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn send(&self, dest: usize, tag: Tag, payload: &[u8]) -> Result<()> {
        let mailbox = self.mailbox_of(dest)?;
        let mut queue = mailbox
            .queue
            .lock()
            .map_err(|_| protocol_error!("send", "mailbox of rank {} poisoned", dest))?;
        queue.push_back(Envelope {
            context: self.context,
            source: self.rank,
            tag,
            payload: payload.to_vec(),
        });
        mailbox.arrived.notify_all();
        Ok(())
    }

    fn recv(&self, source: usize, tag: Tag) -> Result<Vec<u8>> {
        if source >= self.size() {
            return Err(protocol_error!(
                "recv",
                "source rank {} outside communicator of {}",
                source,
                self.size()
            ));
        }
        let mailbox = self.mailbox_of(self.rank)?;
        let mut queue = mailbox
            .queue
            .lock()
            .map_err(|_| protocol_error!("recv", "mailbox of rank {} poisoned", self.rank))?;
        loop {
            let matching = queue
                .iter()
                .position(|e| e.context == self.context && e.source == source && e.tag == tag);
            if let Some(envelope) = matching.and_then(|pos| queue.remove(pos)) {
                return Ok(envelope.payload);
            }
            if self.shared.aborted.load(Ordering::Acquire) {
                return Err(protocol_error!(
                    "recv",
                    "a peer worker failed while rank {} waited on rank {} (tag {})",
                    self.rank,
                    source,
                    tag
                ));
            }
            queue = mailbox
                .arrived
                .wait(queue)
                .map_err(|_| protocol_error!("recv", "mailbox of rank {} poisoned", self.rank))?;
        }
    }

    fn split(&self, color: Option<usize>, key: usize) -> Result<Option<Self>> {
        const UNDEFINED: i64 = -1;
        let mine = [color.map_or(UNDEFINED, |c| c as i64), key as i64];

        // Root assigns one fresh context per colour and broadcasts the table
        // of (colour, key, context) for every rank.
        let table: Vec<i64> = match self.gather_bytes(0, bytemuck::cast_slice(&mine))? {
            Some(entries) => {
                let mut table = Vec::with_capacity(3 * entries.len());
                let mut contexts: Vec<(i64, u64)> = Vec::new();
                for entry in &entries {
                    let pair = super::comm::decode::<i64>(entry)?;
                    if pair.len() != 2 {
                        return Err(protocol_error!("split", "malformed split request"));
                    }
                    let context = if pair[0] == UNDEFINED {
                        0
                    } else if let Some(&(_, ctx)) = contexts.iter().find(|(c, _)| *c == pair[0]) {
                        ctx
                    } else {
                        let ctx = self.shared.next_context.fetch_add(1, Ordering::Relaxed);
                        contexts.push((pair[0], ctx));
                        ctx
                    };
                    table.extend_from_slice(&[pair[0], pair[1], context as i64]);
                }
                self.broadcast(0, table.as_slice())?
            }
            None => self.broadcast::<i64>(0, &[])?,
        };
        if table.len() != 3 * self.size() {
            return Err(protocol_error!(
                "split",
                "split table covers {} entries, group has {}",
                table.len() / 3,
                self.size()
            ));
        }

        let Some(color) = color else {
            return Ok(None);
        };
        let mut group: Vec<(i64, usize)> = table
            .chunks_exact(3)
            .enumerate()
            .filter(|(_, e)| e[0] == color as i64)
            .map(|(r, e)| (e[1], r))
            .collect();
        group.sort_unstable();

        let rank = group
            .iter()
            .position(|&(_, r)| r == self.rank)
            .ok_or_else(|| protocol_error!("split", "rank {} missing from its own group", self.rank))?;
        let context = table[3 * self.rank + 2] as u64;

        Ok(Some(LocalComm {
            shared: Arc::clone(&self.shared),
            context,
            rank,
            members: group.iter().map(|&(_, r)| self.members[r]).collect(),
        }))
    }
}

/// Launcher for a set of in-process workers.
pub struct LocalUniverse;

impl LocalUniverse {
    /// Run `worker` on `workers` threads, each handed its world
    /// communicator, and return the results in rank order.
    ///
    /// The first failing worker wakes all others; its error is returned.
    /// A panicking worker's panic is resumed on the calling thread.
    pub fn run<T, F>(workers: usize, worker: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(LocalComm) -> Result<T> + Sync,
    {
        if workers == 0 {
            return Err(DlbError::Config("at least one worker is required".into()));
        }
        let shared = Arc::new(Shared::new(workers));
        let _span = tracing::debug_span!("local_universe", workers).entered();

        let mut panic_payload = None;
        let mut results: Vec<Result<T>> = Vec::with_capacity(workers);

        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for rank in 0..workers {
                let comm = LocalComm::world(Arc::clone(&shared), rank, workers);
                let worker_shared = Arc::clone(&shared);
                let worker = &worker;
                let spawned = thread::Builder::new()
                    .name(format!("worker-{rank}"))
                    .spawn_scoped(scope, move || {
                        let guard = AbortOnPanic {
                            shared: worker_shared,
                            rank,
                        };
                        let result = worker(comm);
                        if result.is_err() {
                            guard.shared.abort(rank);
                        }
                        result
                    });
                if spawned.is_err() {
                    shared.abort(rank);
                }
                handles.push(spawned);
            }
            for (rank, handle) in handles.into_iter().enumerate() {
                let joined = match handle {
                    Ok(handle) => handle.join(),
                    Err(e) => Ok(Err(DlbError::Io(e))),
                };
                match joined {
                    Ok(result) => results.push(result),
                    Err(payload) => {
                        panic_payload.get_or_insert(payload);
                        results.push(Err(DlbError::Invariant(format!("worker {rank} panicked"))));
                    }
                }
            }
        });

        if let Some(payload) = panic_payload {
            std::panic::resume_unwind(payload);
        }

        let failed = shared.failed_rank.lock().ok().and_then(|f| *f);
        if let Some(rank) = failed {
            // Report the root cause rather than the peers it woke up.
            if rank < results.len() && results[rank].is_err() {
                return Err(results.swap_remove(rank).err().unwrap_or_else(|| {
                    DlbError::Invariant(format!("worker {rank} failed"))
                }));
            }
        }
        results.into_iter().collect()
    }
}
