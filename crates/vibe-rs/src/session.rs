//! Per-session conversation state.
//!
//! A [`Session`] owns one [`ContextWindow`] plus user metadata and an expiry
//! time. The [`SessionRegistry`] hands out sessions as
//! `Arc<tokio::sync::Mutex<Session>>`: whoever holds the lock owns the
//! window for the duration of a turn, so turns on one session serialise
//! while different sessions proceed in parallel.
//!
//! Persistence is optional. With a [`SessionStore`] attached, sessions are
//! written as one JSON file each, using an atomic temp-file + rename write.
//! [`SessionRegistry::load_all`] warms the registry from the store at start
//! up, [`SessionRegistry::spawn_autosave`] flushes it periodically, and
//! [`SessionRegistry::shutdown`] stops the flusher and writes a final time.
//!
//! ```text
//! <dir>/
//!   ss-18c5a3b2f0e-0000.json
//!   ss-18c5a3b2f41-0001.json
//! ```

use crate::SessionError;
use crate::context::{ContextWindow, WindowSnapshot};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared handle to a live session.
pub type SessionHandle = Arc<tokio::sync::Mutex<Session>>;

/// Generate a unique session ID: `ss-<hex millis>-<hex counter>`.
pub fn generate_session_id() -> String {
    let ts = Utc::now().timestamp_millis();
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("ss-{ts:x}-{count:04x}")
}

// ── Session ────────────────────────────────────────────────────────

/// Serialized form of a [`Session`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionState {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub preferences: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub plugin_data: BTreeMap<String, serde_json::Value>,
    pub window: WindowSnapshot,
}

/// A live conversation: window, user metadata and expiry.
#[derive(Debug)]
pub struct Session {
    id: String,
    user_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    pub preferences: BTreeMap<String, serde_json::Value>,
    /// Per-plugin scratch data, keyed by plugin name.
    pub plugin_data: BTreeMap<String, serde_json::Value>,
    pub window: ContextWindow,
}

impl Session {
    pub fn new(id: impl Into<String>, user_id: Option<String>, window: ContextWindow) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id,
            created_at: now,
            updated_at: now,
            expires_at: None,
            preferences: BTreeMap::new(),
            plugin_data: BTreeMap::new(),
            window,
        }
    }

    /// Set the expiry relative to now (builder pattern). Fails when
    /// `now + ttl` is outside the representable date range.
    pub fn with_ttl(mut self, ttl: TimeDelta) -> Result<Self, SessionError> {
        self.expires_at = Some(expiry_after(Utc::now(), ttl)?);
        Ok(self)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Sessions without an expiry never expire.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Move the expiry to `hours` from now.
    pub fn extend(&mut self, hours: i64) -> Result<(), SessionError> {
        let ttl = TimeDelta::try_hours(hours)
            .ok_or_else(|| SessionError::InvalidTtl(format!("{hours} hours is out of range")))?;
        let now = Utc::now();
        self.expires_at = Some(expiry_after(now, ttl)?);
        self.updated_at = now;
        Ok(())
    }

    /// Mark the session as modified.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn to_state(&self) -> SessionState {
        SessionState {
            session_id: self.id.clone(),
            user_id: self.user_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
            preferences: self.preferences.clone(),
            plugin_data: self.plugin_data.clone(),
            window: self.window.snapshot(),
        }
    }

    pub fn from_state(state: SessionState) -> Result<Self, SessionError> {
        Ok(Self {
            window: ContextWindow::restore(state.window)?,
            id: state.session_id,
            user_id: state.user_id,
            created_at: state.created_at,
            updated_at: state.updated_at,
            expires_at: state.expires_at,
            preferences: state.preferences,
            plugin_data: state.plugin_data,
        })
    }
}

fn expiry_after(now: DateTime<Utc>, ttl: TimeDelta) -> Result<DateTime<Utc>, SessionError> {
    now.checked_add_signed(ttl)
        .ok_or_else(|| SessionError::InvalidTtl(format!("{ttl} from now is out of range")))
}

// ── Store ──────────────────────────────────────────────────────────

/// One JSON file per session under a directory.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Open (and create if needed) a store directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path for a session id. Path separators become `_`.
    pub fn path_for(&self, id: &str) -> PathBuf {
        let safe: String = id
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    /// Atomic write: serialize to a temp file, then rename into place.
    pub fn save(&self, state: &SessionState) -> Result<(), SessionError> {
        let final_path = self.path_for(&state.session_id);
        let tmp_path = final_path.with_extension("json.tmp");

        let json = serde_json::to_string_pretty(state)?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &final_path)?;
        debug!(session = %state.session_id, path = %final_path.display(), "Saved session");
        Ok(())
    }

    /// Load a session; `Ok(None)` when no file exists.
    pub fn load(&self, id: &str) -> Result<Option<SessionState>, SessionError> {
        let path = self.path_for(id);
        match std::fs::read_to_string(&path) {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a session file. Returns whether it existed.
    pub fn delete(&self, id: &str) -> Result<bool, SessionError> {
        match std::fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, id: &str) -> bool {
        self.path_for(id).is_file()
    }

    /// Ids of all stored sessions, sorted.
    pub fn list_ids(&self) -> Result<Vec<String>, SessionError> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

// ── Registry ───────────────────────────────────────────────────────

/// Builds the window for a new session.
pub type WindowFactory = Box<dyn Fn() -> ContextWindow + Send + Sync>;

/// Shortest accepted autosave period.
pub const MIN_AUTOSAVE_INTERVAL: Duration = Duration::from_millis(10);

/// Live sessions, keyed by id, with optional persistence.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
    store: Option<SessionStore>,
    ttl: TimeDelta,
    new_window: WindowFactory,
    autosave: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .field("store", &self.store)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(TimeDelta::hours(24))
    }
}

impl SessionRegistry {
    /// A registry whose sessions expire `ttl` after creation and start
    /// with a default window.
    pub fn new(ttl: TimeDelta) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            store: None,
            ttl,
            new_window: Box::new(ContextWindow::default),
            autosave: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// A registry for one agent: TTL from its config, windows from
    /// [`ChatAgent::new_window`](crate::agent::ChatAgent::new_window).
    pub fn for_agent(agent: Arc<crate::agent::ChatAgent>) -> Self {
        let ttl = TimeDelta::hours(i64::from(agent.config().session_ttl_hours));
        Self::new(ttl).with_window_factory(move || agent.new_window())
    }

    pub fn with_store(mut self, store: SessionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_window_factory(
        mut self,
        factory: impl Fn() -> ContextWindow + Send + Sync + 'static,
    ) -> Self {
        self.new_window = Box::new(factory);
        self
    }

    pub fn store(&self) -> Option<&SessionStore> {
        self.store.as_ref()
    }

    /// Number of sessions held in memory.
    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a session and return its id. Saved immediately when a store
    /// is attached.
    pub fn create(&self, user_id: Option<&str>) -> Result<String, SessionError> {
        let id = generate_session_id();
        let session = Session::new(id.clone(), user_id.map(String::from), (self.new_window)())
            .with_ttl(self.ttl)?;

        if let Some(store) = &self.store {
            store.save(&session.to_state())?;
        }
        self.map()
            .insert(id.clone(), Arc::new(tokio::sync::Mutex::new(session)));
        info!(session = %id, user = ?user_id, "Created session");
        Ok(id)
    }

    /// Look up a session, loading it from the store if it is not in memory.
    /// Expired sessions are removed and reported as
    /// [`SessionError::Expired`].
    pub async fn get(&self, id: &str) -> Result<SessionHandle, SessionError> {
        let cached = self.map().get(id).cloned();
        if let Some(handle) = cached {
            if handle.lock().await.is_expired() {
                self.remove(id)?;
                return Err(SessionError::Expired(id.to_string()));
            }
            return Ok(handle);
        }

        let Some(store) = &self.store else {
            return Err(SessionError::NotFound(id.to_string()));
        };
        let state = store
            .load(id)?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let session = Session::from_state(state)?;
        if session.is_expired() {
            store.delete(id)?;
            return Err(SessionError::Expired(id.to_string()));
        }

        debug!(session = id, "Loaded session from store");
        let handle = self
            .map()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(session)))
            .clone();
        Ok(handle)
    }

    /// Persist a session's current state. A no-op without a store.
    pub async fn save(&self, id: &str) -> Result<(), SessionError> {
        let handle = self
            .map()
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let mut session = handle.lock().await;
        session.touch();
        self.persist(&session)
    }

    /// Persist a session the caller already holds the lock for.
    pub fn persist(&self, session: &Session) -> Result<(), SessionError> {
        match &self.store {
            Some(store) => store.save(&session.to_state()),
            None => Ok(()),
        }
    }

    /// Remove a session from memory and the store. Returns whether it
    /// existed in either.
    pub fn remove(&self, id: &str) -> Result<bool, SessionError> {
        let in_memory = self.map().remove(id).is_some();
        let on_disk = match &self.store {
            Some(store) => store.delete(id)?,
            None => false,
        };
        if in_memory || on_disk {
            info!(session = id, "Removed session");
        }
        Ok(in_memory || on_disk)
    }

    /// Ids of live, unexpired in-memory sessions, optionally only those of
    /// one user. Sorted.
    pub async fn list(&self, user_id: Option<&str>) -> Vec<String> {
        let handles = self.handles();

        let mut ids = Vec::new();
        for (id, handle) in handles {
            let session = handle.lock().await;
            if session.is_expired() {
                continue;
            }
            if user_id.is_none_or(|u| session.user_id() == Some(u)) {
                ids.push(id);
            }
        }
        ids.sort();
        ids
    }

    /// Remove every expired session, in memory and in the store. Returns
    /// how many were removed.
    pub async fn cleanup_expired(&self) -> Result<usize, SessionError> {
        let handles = self.handles();

        let mut expired = Vec::new();
        for (id, handle) in handles {
            if handle.lock().await.is_expired() {
                expired.push(id);
            }
        }

        if let Some(store) = &self.store {
            let now = Utc::now();
            for id in store.list_ids()? {
                if expired.contains(&id) || self.map().contains_key(&id) {
                    continue;
                }
                match store.load(&id) {
                    Ok(Some(state)) if state.expires_at.is_some_and(|at| now > at) => {
                        expired.push(id);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(session = %id, "Skipping unreadable session file: {e}"),
                }
            }
        }

        for id in &expired {
            self.remove(id)?;
        }
        if !expired.is_empty() {
            info!(removed = expired.len(), "Cleaned up expired sessions");
        }
        Ok(expired.len())
    }

    /// Move a session's expiry to `hours` from now and persist it.
    pub async fn extend(&self, id: &str, hours: i64) -> Result<(), SessionError> {
        let handle = self.get(id).await?;
        let mut session = handle.lock().await;
        session.extend(hours)?;
        self.persist(&session)?;
        debug!(session = id, hours, "Extended session");
        Ok(())
    }

    // ── Bulk persistence ──

    fn handles(&self) -> Vec<(String, SessionHandle)> {
        self.map()
            .iter()
            .map(|(id, h)| (id.clone(), Arc::clone(h)))
            .collect()
    }

    /// Load every unexpired stored session that is not already in memory.
    /// Expired files are deleted; unreadable ones are skipped with a warning.
    /// Returns how many sessions were loaded.
    pub fn load_all(&self) -> Result<usize, SessionError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let mut loaded = 0;
        for id in store.list_ids()? {
            if self.map().contains_key(&id) {
                continue;
            }
            let session = match store.load(&id).and_then(|state| match state {
                Some(state) => Session::from_state(state).map(Some),
                None => Ok(None),
            }) {
                Ok(Some(session)) => session,
                Ok(None) => continue,
                Err(e) => {
                    warn!(session = %id, "Skipping unreadable session file: {e}");
                    continue;
                }
            };
            if session.is_expired() {
                store.delete(&id)?;
                continue;
            }
            self.map()
                .entry(id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(session)));
            loaded += 1;
        }
        info!(loaded, "Loaded stored sessions");
        Ok(loaded)
    }

    /// Write every in-memory session to the store. Failures are logged and
    /// skipped. Returns how many were written; always 0 without a store.
    pub async fn save_all(&self) -> usize {
        if self.store.is_none() {
            return 0;
        }
        let mut saved = 0;
        for (id, handle) in self.handles() {
            let session = handle.lock().await;
            match self.persist(&session) {
                Ok(()) => saved += 1,
                Err(e) => warn!(session = %id, "Autosave failed: {e}"),
            }
        }
        saved
    }

    /// Start a background task that saves every session and removes expired
    /// ones once per `every` (at least [`MIN_AUTOSAVE_INTERVAL`]). A second
    /// call replaces the running task. The task holds a weak reference and
    /// stops on its own once the registry is dropped.
    pub fn spawn_autosave(self: &Arc<Self>, every: Duration) {
        let every = every.max(MIN_AUTOSAVE_INTERVAL);
        let registry = Arc::downgrade(self);
        let cancel = self.cancel.child_token();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(registry) = registry.upgrade() else {
                            break;
                        };
                        let saved = registry.save_all().await;
                        if let Err(e) = registry.cleanup_expired().await {
                            warn!("Autosave cleanup failed: {e}");
                        }
                        debug!(saved, "Autosaved sessions");
                    }
                }
            }
            debug!("Autosave task stopped");
        });

        let previous = self
            .autosave
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!(interval_ms = every.as_millis() as u64, "Started session autosave");
    }

    /// Whether an autosave task is running.
    pub fn is_autosaving(&self) -> bool {
        self.autosave
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop autosave, wait for it to finish, then save every session one
    /// last time. Returns how many sessions the final flush wrote. Autosave
    /// cannot be restarted afterwards.
    pub async fn shutdown(&self) -> usize {
        self.cancel.cancel();
        let task = self
            .autosave
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!("Autosave task ended abnormally: {e}");
        }
        let saved = self.save_all().await;
        info!(saved, "Session registry shut down");
        saved
    }
}
