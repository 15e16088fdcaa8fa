//! Trigger engine: computes fire times and reports them on a channel.
//!
//! The engine knows nothing about jobs beyond their ids. It owns a map of
//! armed triggers, sleeps until the earliest one is due (never longer than
//! the tick interval), emits a [`TriggerFired`] and re-arms recurring
//! triggers from their schedule. The scheduler listens on the receiving end.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::model::JobId;
use super::schedule::ScheduleSpec;

/// What an armed trigger is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "job_id", rename_all = "snake_case")]
pub enum TriggerKey {
    /// The job's regular schedule
    Job(JobId),
    /// A pending retry of the job
    Retry(JobId),
}

impl TriggerKey {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Job(id) | Self::Retry(id) => *id,
        }
    }
}

/// Emitted when a trigger comes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerFired {
    pub key: TriggerKey,
    pub scheduled_for: DateTime<Utc>,
}

/// A snapshot of one armed trigger.
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredTrigger {
    pub key: TriggerKey,
    pub next_fire: DateTime<Utc>,
    pub recurring: bool,
}

#[derive(Debug, Clone)]
struct ArmedTrigger {
    spec: ScheduleSpec,
    next_fire: DateTime<Utc>,
}

/// Background component that owns fire times.
pub trait TriggerEngine: Send + Sync {
    /// Engine name reported in scheduler status.
    fn name(&self) -> &str;

    /// Arm (or replace) `key` to fire first at `first_fire`, then per `spec`.
    fn arm(&self, key: TriggerKey, spec: ScheduleSpec, first_fire: DateTime<Utc>);

    /// Remove `key`. Returns whether it was armed.
    fn disarm(&self, key: TriggerKey) -> bool;

    fn next_fire(&self, key: TriggerKey) -> Option<DateTime<Utc>>;

    fn registered(&self) -> Vec<RegisteredTrigger>;

    fn is_running(&self) -> bool;

    fn shutdown(&self);
}

/// A connected engine plus the channel its fires arrive on.
pub struct EngineConnection {
    pub engine: Arc<dyn TriggerEngine>,
    pub fired: mpsc::UnboundedReceiver<TriggerFired>,
}

impl std::fmt::Debug for EngineConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConnection")
            .field("engine", &self.engine.name())
            .finish_non_exhaustive()
    }
}

/// Probes whether a trigger engine can run and starts one.
pub trait TriggerEngineProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Start an engine, or explain why none is available.
    fn connect(&self) -> std::result::Result<EngineConnection, String>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tokio Engine
// ═══════════════════════════════════════════════════════════════════════════════

/// In-process engine driven by a tokio task.
pub struct TokioTriggerEngine {
    triggers: Arc<Mutex<HashMap<TriggerKey, ArmedTrigger>>>,
    wake: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TokioTriggerEngine {
    pub const NAME: &'static str = "tokio";

    /// Spawn the engine loop. Must be called inside a tokio runtime.
    pub fn start(tick: Duration) -> EngineConnection {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let triggers = Arc::new(Mutex::new(HashMap::new()));
        let wake = Arc::new(Notify::new());

        let task = tokio::spawn(run_loop(
            triggers.clone(),
            wake.clone(),
            shutdown_rx,
            fired_tx,
            tick.max(Duration::from_millis(10)),
        ));

        let engine = Arc::new(Self {
            triggers,
            wake,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        });

        info!(tick_ms = tick.as_millis() as u64, "Trigger engine started");
        EngineConnection { engine, fired: fired_rx }
    }
}

impl TriggerEngine for TokioTriggerEngine {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn arm(&self, key: TriggerKey, spec: ScheduleSpec, first_fire: DateTime<Utc>) {
        debug!(?key, %first_fire, "Trigger armed");
        self.triggers.lock().insert(key, ArmedTrigger { spec, next_fire: first_fire });
        self.wake.notify_one();
    }

    fn disarm(&self, key: TriggerKey) -> bool {
        let removed = self.triggers.lock().remove(&key).is_some();
        if removed {
            debug!(?key, "Trigger disarmed");
        }
        removed
    }

    fn next_fire(&self, key: TriggerKey) -> Option<DateTime<Utc>> {
        self.triggers.lock().get(&key).map(|t| t.next_fire)
    }

    fn registered(&self) -> Vec<RegisteredTrigger> {
        let mut list: Vec<_> = self
            .triggers
            .lock()
            .iter()
            .map(|(key, t)| RegisteredTrigger {
                key: *key,
                next_fire: t.next_fire,
                recurring: t.spec.is_recurring(),
            })
            .collect();
        list.sort_by_key(|t| t.next_fire);
        list
    }

    fn is_running(&self) -> bool {
        !*self.shutdown.borrow()
            && self
                .task
                .lock()
                .as_ref()
                .map(|t| !t.is_finished())
                .unwrap_or(false)
    }

    fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.triggers.lock().clear();
        info!("Trigger engine stopped");
    }
}

impl Drop for TokioTriggerEngine {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn run_loop(
    triggers: Arc<Mutex<HashMap<TriggerKey, ArmedTrigger>>>,
    wake: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
    fired: mpsc::UnboundedSender<TriggerFired>,
    tick: Duration,
) {
    loop {
        let now = Utc::now();
        for event in take_due(&triggers, now) {
            if fired.send(event).is_err() {
                warn!("Trigger listener dropped; engine loop exiting");
                return;
            }
        }

        let sleep_for = triggers
            .lock()
            .values()
            .map(|t| t.next_fire)
            .min()
            .and_then(|next| (next - Utc::now()).to_std().ok())
            .map(|d| d.min(tick))
            .unwrap_or(tick);

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = wake.notified() => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// Pop every due trigger, re-arming the recurring ones.
fn take_due(triggers: &Mutex<HashMap<TriggerKey, ArmedTrigger>>, now: DateTime<Utc>) -> Vec<TriggerFired> {
    let mut map = triggers.lock();
    let due: Vec<TriggerKey> = map
        .iter()
        .filter(|(_, t)| t.next_fire <= now)
        .map(|(k, _)| *k)
        .collect();

    let mut events = Vec::with_capacity(due.len());
    for key in due {
        let Some(trigger) = map.get_mut(&key) else { continue };
        let scheduled_for = trigger.next_fire;
        events.push(TriggerFired { key, scheduled_for });

        match trigger.spec.next_fire_after(scheduled_for, now) {
            Some(next) => trigger.next_fire = next,
            None => {
                map.remove(&key);
            }
        }
    }
    events
}

// ═══════════════════════════════════════════════════════════════════════════════
// Provider
// ═══════════════════════════════════════════════════════════════════════════════

/// Starts a [`TokioTriggerEngine`] unless scheduling is switched off, either
/// in configuration or by a `scheduler.disabled` file in the data directory.
#[derive(Debug, Clone)]
pub struct LocalEngineProvider {
    enabled: bool,
    disabled_marker: PathBuf,
    tick: Duration,
}

impl LocalEngineProvider {
    pub const DISABLED_MARKER: &'static str = "scheduler.disabled";

    pub fn new(enabled: bool, data_dir: impl Into<PathBuf>, tick: Duration) -> Self {
        Self {
            enabled,
            disabled_marker: data_dir.into().join(Self::DISABLED_MARKER),
            tick,
        }
    }
}

impl TriggerEngineProvider for LocalEngineProvider {
    fn name(&self) -> &str {
        TokioTriggerEngine::NAME
    }

    fn connect(&self) -> std::result::Result<EngineConnection, String> {
        if !self.enabled {
            return Err("scheduler disabled in configuration".to_string());
        }
        if self.disabled_marker.exists() {
            return Err(format!("{} is present", self.disabled_marker.display()));
        }
        Ok(TokioTriggerEngine::start(self.tick))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn interval(secs: u64) -> ScheduleSpec {
        ScheduleSpec::Interval(Duration::from_secs(secs))
    }

    #[test]
    fn test_take_due_rearms_interval_and_drops_once() {
        let now = Utc::now();
        let map = Mutex::new(HashMap::new());
        map.lock().insert(
            TriggerKey::Job(1),
            ArmedTrigger { spec: interval(60), next_fire: now - ChronoDuration::seconds(1) },
        );
        map.lock().insert(
            TriggerKey::Retry(2),
            ArmedTrigger { spec: ScheduleSpec::Once(now), next_fire: now },
        );
        map.lock().insert(
            TriggerKey::Job(3),
            ArmedTrigger { spec: interval(60), next_fire: now + ChronoDuration::seconds(30) },
        );

        let fired = take_due(&map, now);
        assert_eq!(fired.len(), 2);

        let map = map.lock();
        assert!(!map.contains_key(&TriggerKey::Retry(2)));
        assert!(map[&TriggerKey::Job(1)].next_fire > now);
        assert_eq!(map[&TriggerKey::Job(3)].next_fire, now + ChronoDuration::seconds(30));
    }

    #[tokio::test]
    async fn test_engine_fires_due_trigger() {
        let mut conn = TokioTriggerEngine::start(Duration::from_millis(50));
        let at = Utc::now() + ChronoDuration::milliseconds(100);
        conn.engine.arm(TriggerKey::Retry(7), ScheduleSpec::Once(at), at);

        let fired = tokio::time::timeout(Duration::from_secs(3), conn.fired.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired.key, TriggerKey::Retry(7));
        assert_eq!(fired.scheduled_for, at);
        assert!(conn.engine.registered().is_empty());
        conn.engine.shutdown();
        assert!(!conn.engine.is_running());
    }

    #[tokio::test]
    async fn test_disarm() {
        let conn = TokioTriggerEngine::start(Duration::from_millis(50));
        let at = Utc::now() + ChronoDuration::hours(1);
        conn.engine.arm(TriggerKey::Job(1), interval(3600), at);
        assert_eq!(conn.engine.next_fire(TriggerKey::Job(1)), Some(at));
        assert!(conn.engine.disarm(TriggerKey::Job(1)));
        assert!(!conn.engine.disarm(TriggerKey::Job(1)));
        assert!(conn.engine.is_running());
    }

    #[tokio::test]
    async fn test_provider_honours_disabled_marker() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalEngineProvider::new(true, dir.path(), Duration::from_millis(50));
        assert!(provider.connect().is_ok());

        std::fs::write(dir.path().join(LocalEngineProvider::DISABLED_MARKER), b"").unwrap();
        assert!(provider.connect().is_err());

        let off = LocalEngineProvider::new(false, dir.path(), Duration::from_millis(50));
        assert!(off.connect().unwrap_err().contains("configuration"));
    }
}
