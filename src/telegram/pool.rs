//! Streaming worker pool.
//!
//! Multiplexes read requests over a rotating set of bot workers per channel,
//! falling back to one worker per user session when bots are disabled or
//! absent. Workers are long-lived; a request borrows one through a
//! [`WorkerLease`] whose drop releases the in-flight slot, so readers give
//! their slot back on every exit path.

use crate::config::TelegramConfig;
use crate::error::{Error, Result};
use crate::reader::{ChunkSource, Location};
use crate::telegram::client::StreamClient;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// How long a decommissioned worker may drain before being dropped.
const DRAIN_GRACE: Duration = Duration::from_secs(30);

/// Factory for authenticated worker connections.
///
/// The production implementation is [`TgConnector`]; tests plug in a fake so
/// pool behavior is exercised without a network.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Send + Sync + 'static;

    /// Connect and sign in a bot worker.
    async fn connect_bot(&self, token: &str) -> Result<Self::Conn>;

    /// Connect a worker from an exported user session string.
    async fn connect_user(&self, session: &str) -> Result<Self::Conn>;
}

/// Connector producing real [`StreamClient`] workers.
pub struct TgConnector {
    api_id: i32,
    api_hash: String,
}

impl TgConnector {
    pub fn new(config: &TelegramConfig) -> Self {
        TgConnector {
            api_id: config.api_id,
            api_hash: config.api_hash.clone(),
        }
    }
}

#[async_trait]
impl Connector for TgConnector {
    type Conn = StreamClient;

    async fn connect_bot(&self, token: &str) -> Result<StreamClient> {
        StreamClient::connect_bot(self.api_id, &self.api_hash, token).await
    }

    async fn connect_user(&self, session: &str) -> Result<StreamClient> {
        StreamClient::connect_user(self.api_id, &self.api_hash, session).await
    }
}

/// One pooled worker: a connection plus its in-flight accounting.
pub struct Worker<C> {
    conn: C,
    /// Bot token this worker was built from ("" for user workers)
    token: String,
    /// Short credential tag for logging
    tag: String,
    in_flight: AtomicUsize,
    cap: usize,
}

impl<C> Worker<C> {
    fn new(conn: C, token: String, tag: String, cap: usize) -> Self {
        Worker {
            conn,
            token,
            tag,
            in_flight: AtomicUsize::new(0),
            cap,
        }
    }

    /// Current number of reads borrowed from this worker.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// RAII borrow of a worker; dropping it releases the in-flight slot.
pub struct WorkerLease<C> {
    worker: Arc<Worker<C>>,
}

impl<C> WorkerLease<C> {
    /// The underlying connection.
    pub fn conn(&self) -> &C {
        &self.worker.conn
    }

    /// Credential tag for logging.
    pub fn tag(&self) -> &str {
        &self.worker.tag
    }
}

impl<C> Drop for WorkerLease<C> {
    fn drop(&mut self) {
        self.worker.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[async_trait]
impl<C: ChunkSource> ChunkSource for WorkerLease<C> {
    async fn chunk(&self, location: &Location, offset: i64, limit: i32) -> Result<Bytes> {
        self.worker.conn.chunk(location, offset, limit).await
    }

    async fn refresh(&self, location: &Location) -> Result<Location> {
        self.worker.conn.refresh(location).await
    }
}

fn lease<C>(worker: Arc<Worker<C>>) -> WorkerLease<C> {
    worker.in_flight.fetch_add(1, Ordering::AcqRel);
    WorkerLease { worker }
}

struct ChannelSet<C> {
    workers: Vec<Arc<Worker<C>>>,
    cursor: usize,
    tokens_hash: u64,
    last_used: Instant,
}

/// Per-channel rotating worker sets plus per-user fallback workers.
pub struct StreamWorker<N: Connector> {
    connector: N,
    cap: usize,
    idle_ttl: Duration,
    channels: Mutex<HashMap<i64, ChannelSet<N::Conn>>>,
    users: Mutex<HashMap<i64, Arc<Worker<N::Conn>>>>,
}

impl<N: Connector> StreamWorker<N> {
    /// Build a pool handing out workers capped at `cap` in-flight reads each.
    pub fn new(connector: N, cap: usize, idle_ttl: Duration) -> Self {
        StreamWorker {
            connector,
            cap: cap.max(1),
            idle_ttl,
            channels: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Idempotently make the channel's worker set match `tokens`.
    ///
    /// An unchanged token list is a no-op that preserves worker identity and
    /// the rotation cursor. On change, workers for kept tokens are reused,
    /// new ones are connected, removed ones drain in the background and the
    /// cursor resets.
    pub async fn set(&self, tokens: &[String], channel_id: i64) -> Result<()> {
        let hash = tokens_hash(tokens);

        let previous = {
            let mut channels = self.channels.lock().await;
            self.evict_idle(&mut channels);
            match channels.get_mut(&channel_id) {
                Some(set) if set.tokens_hash == hash => {
                    set.last_used = Instant::now();
                    return Ok(());
                }
                Some(set) => set.workers.clone(),
                None => Vec::new(),
            }
        };

        // Build the new roster outside the lock; connects can be slow
        let mut reusable: HashMap<&str, Arc<Worker<N::Conn>>> = previous
            .iter()
            .map(|worker| (worker.token.as_str(), worker.clone()))
            .collect();

        let mut workers = Vec::with_capacity(tokens.len());
        for token in tokens {
            if let Some(worker) = reusable.remove(token.as_str()) {
                workers.push(worker);
                continue;
            }
            match self.connector.connect_bot(token).await {
                Ok(conn) => workers.push(Arc::new(Worker::new(
                    conn,
                    token.clone(),
                    bot_tag(token),
                    self.cap,
                ))),
                Err(err) => {
                    warn!("failed to start worker for bot {}: {}", bot_tag(token), err);
                }
            }
        }

        if workers.is_empty() {
            return Err(Error::Worker(format!(
                "no workers available for channel {}",
                channel_id
            )));
        }

        for (_, removed) in reusable {
            decommission(removed);
        }

        let mut channels = self.channels.lock().await;
        channels.insert(
            channel_id,
            ChannelSet {
                workers,
                cursor: 0,
                tokens_hash: hash,
                last_used: Instant::now(),
            },
        );
        Ok(())
    }

    /// Borrow the next worker for a channel, round-robin.
    ///
    /// Workers at their in-flight cap are skipped; if every worker is capped
    /// the least-loaded one (lowest index on ties) is handed out anyway, the
    /// cap being a soft bound. Returns the worker's position in the set.
    pub async fn next(&self, channel_id: i64) -> Result<(WorkerLease<N::Conn>, usize)> {
        let mut channels = self.channels.lock().await;
        let set = channels.get_mut(&channel_id).ok_or_else(|| {
            Error::Worker(format!("no worker set for channel {}", channel_id))
        })?;
        set.last_used = Instant::now();

        let count = set.workers.len();
        for step in 0..count {
            let candidate = (set.cursor + step) % count;
            let worker = &set.workers[candidate];
            if worker.in_flight() < worker.cap {
                set.cursor = (candidate + 1) % count;
                return Ok((lease(worker.clone()), candidate));
            }
        }

        let mut best = 0;
        for index in 1..count {
            if set.workers[index].in_flight() < set.workers[best].in_flight() {
                best = index;
            }
        }
        debug!(
            "all workers for channel {} at capacity, using worker {}",
            channel_id, best
        );
        Ok((lease(set.workers[best].clone()), best))
    }

    /// Borrow (creating on first use) the worker for a user session.
    pub async fn user_worker(
        &self,
        session: &str,
        user_id: i64,
    ) -> Result<WorkerLease<N::Conn>> {
        let mut users = self.users.lock().await;
        if let Some(worker) = users.get(&user_id) {
            return Ok(lease(worker.clone()));
        }

        let conn = self.connector.connect_user(session).await?;
        let worker = Arc::new(Worker::new(
            conn,
            String::new(),
            user_id.to_string(),
            self.cap,
        ));
        users.insert(user_id, worker.clone());
        Ok(lease(worker))
    }

    /// Drop channel sets idle past the TTL with nothing in flight.
    fn evict_idle(&self, channels: &mut HashMap<i64, ChannelSet<N::Conn>>) {
        if self.idle_ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        channels.retain(|channel_id, set| {
            let busy = set.workers.iter().any(|worker| worker.in_flight() > 0);
            let keep = busy || now.duration_since(set.last_used) < self.idle_ttl;
            if !keep {
                debug!("evicting idle worker set for channel {}", channel_id);
            }
            keep
        });
    }
}

/// Let a removed worker drain its in-flight reads, then drop it.
fn decommission<C: Send + Sync + 'static>(worker: Arc<Worker<C>>) {
    tokio::spawn(async move {
        let deadline = Instant::now() + DRAIN_GRACE;
        while worker.in_flight() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        if worker.in_flight() > 0 {
            warn!(
                "dropping worker {} with {} reads still in flight",
                worker.tag,
                worker.in_flight()
            );
        }
    });
}

fn tokens_hash(tokens: &[String]) -> u64 {
    let mut hasher = DefaultHasher::new();
    tokens.hash(&mut hasher);
    hasher.finish()
}

/// Bot id portion of a token, for logs.
fn bot_tag(token: &str) -> String {
    token.split(':').next().unwrap_or(token).to_string()
}
