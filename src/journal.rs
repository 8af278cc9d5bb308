use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::model::Event;
use crate::observability;
use crate::wal::Wal;

/// Durable, ordered record of every state change. An append that returns `Ok`
/// survives a restart; one that returns `Err` must not be applied.
#[async_trait]
pub trait Journal: Send + Sync {
    async fn append(&self, event: Event) -> io::Result<()>;

    /// Replace the journal with a snapshot that rebuilds the same state.
    async fn compact(&self, snapshot: Vec<Event>) -> io::Result<()>;

    async fn appends_since_compact(&self) -> u64;
}

// ── File-backed journal with group commit ────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = Vec<(Event, oneshot::Sender<io::Result<()>>)>;

pub struct WalJournal {
    tx: mpsc::Sender<WalCommand>,
}

impl WalJournal {
    /// Open the journal at `path` and start its writer task.
    /// Returns the events recovered from disk for replay.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (wal, recovered) = Wal::open(path)?;
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(writer_loop(wal, rx));
        Ok((Self { tx }, recovered))
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> WalCommand,
    ) -> io::Result<T> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(make(response))
            .await
            .map_err(|_| closed())?;
        rx.await.map_err(|_| closed())
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "journal writer stopped")
}

#[async_trait]
impl Journal for WalJournal {
    async fn append(&self, event: Event) -> io::Result<()> {
        self.request(|response| WalCommand::Append { event, response })
            .await?
    }

    async fn compact(&self, snapshot: Vec<Event>) -> io::Result<()> {
        self.request(|response| WalCommand::Compact { snapshot, response })
            .await?
    }

    async fn appends_since_compact(&self) -> u64 {
        self.request(|response| WalCommand::AppendsSinceCompact { response })
            .await
            .unwrap_or(0)
    }
}

/// Owns the file. Takes the first waiting append, drains whatever else is already
/// queued, and commits them with one fsync.
async fn writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };
        let mut batch: Pending = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_control(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Pending) {
    metrics::histogram!(observability::JOURNAL_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't ride along
    // with the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(observability::JOURNAL_FLUSH_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(error = %e, batch = batch.len(), "journal commit failed");
    }

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let result = Wal::write_compact_file(wal.path(), &snapshot)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed as control command")));
        }
    }
}

// ── In-memory journal ────────────────────────────────────────────

/// Journal kept in memory. Loses everything on restart; used for ephemeral
/// engines and for injecting write failures.
#[derive(Default)]
pub struct MemoryJournal {
    events: Mutex<Vec<Event>>,
    appends_since_compact: Mutex<u64>,
    failures_pending: AtomicU32,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` appends fail with an I/O error.
    pub fn fail_next(&self, n: u32) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn append(&self, event: Event) -> io::Result<()> {
        let injected = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(io::Error::other("injected journal failure"));
        }
        let mut events = self.events.lock().map_err(|_| io::Error::other("poisoned"))?;
        events.push(event);
        if let Ok(mut n) = self.appends_since_compact.lock() {
            *n += 1;
        }
        Ok(())
    }

    async fn compact(&self, snapshot: Vec<Event>) -> io::Result<()> {
        let mut events = self.events.lock().map_err(|_| io::Error::other("poisoned"))?;
        *events = snapshot;
        if let Ok(mut n) = self.appends_since_compact.lock() {
            *n = 0;
        }
        Ok(())
    }

    async fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact.lock().map(|n| *n).unwrap_or(0)
    }
}
