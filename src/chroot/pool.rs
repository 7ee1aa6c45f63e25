// src/chroot/pool.rs

//! Leasing of disposable chroot sessions
//!
//! Each hosted (codename, architecture) pair gets a semaphore sized to the
//! configured session bound. A [`ChrootSession`] owns one permit through the
//! pool's lease table; releasing it (explicitly or by dropping the session)
//! ends the backend session and returns the permit. Release is idempotent,
//! so a builder that panics mid-build still gives its session back exactly
//! once. An acquire abandoned while the backend session is still starting
//! ends that session as soon as it comes up.

use super::BackendKind;
use super::sequence::{CommandRunner, argv};
use crate::config::PoolSection;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// (codename, architecture)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChrootKey {
    pub codename: String,
    pub architecture: String,
}

impl ChrootKey {
    pub fn new(codename: &str, architecture: &str) -> Self {
        Self {
            codename: codename.to_string(),
            architecture: architecture.to_string(),
        }
    }
}

impl fmt::Display for ChrootKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.codename, self.architecture)
    }
}

/// Begins and ends backend sessions on a chroot
pub trait SessionProvider: Send + Sync {
    /// Start a session on `chroot`, returning its backend id
    fn begin(&self, chroot: &str) -> Result<String>;

    fn end(&self, session: &str) -> Result<()>;
}

/// schroot-backed sessions
pub struct SchrootSessions {
    runner: Arc<dyn CommandRunner>,
}

impl SchrootSessions {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl SessionProvider for SchrootSessions {
    fn begin(&self, chroot: &str) -> Result<String> {
        let out = self
            .runner
            .run(&argv(&["schroot", "--begin-session", "--chroot", chroot]))?;
        let id = out.trim();
        if id.is_empty() {
            return Err(Error::IoError(format!("schroot returned no session for {}", chroot)));
        }
        Ok(id.to_string())
    }

    fn end(&self, session: &str) -> Result<()> {
        self.runner
            .run(&argv(&["schroot", "--end-session", "--chroot", &format!("session:{}", session)]))
            .map(|_| ())
    }
}

struct Hosted {
    chroot: String,
    backend: BackendKind,
    semaphore: Arc<Semaphore>,
}

struct Lease {
    key: ChrootKey,
    backend_session: String,
    owner: String,
    expires_at: DateTime<Utc>,
    _permit: OwnedSemaphorePermit,
}

/// An acquire whose backend session is still starting
struct Starting {
    owner: String,
    abandoned: bool,
}

struct PoolInner {
    provider: Arc<dyn SessionProvider>,
    max_sessions: usize,
    lease_ttl: Duration,
    hosted: RwLock<HashMap<ChrootKey, Hosted>>,
    // lock order: starting before leases
    starting: Mutex<HashMap<u64, Starting>>,
    leases: Mutex<HashMap<u64, Lease>>,
    next_id: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl PoolInner {
    fn release(&self, id: u64) -> bool {
        let lease = self.leases.lock().remove(&id);
        let Some(lease) = lease else {
            return false;
        };
        if let Err(e) = self.provider.end(&lease.backend_session) {
            warn!(
                "[pool] ending session {} on {} failed: {}",
                lease.backend_session, lease.key, e
            );
        }
        self.released.fetch_add(1, Ordering::SeqCst);
        debug!("[pool] released session {} ({})", id, lease.key);
        true
    }

    /// Give up on acquire `id`; its session is ended once it exists
    fn abandon(&self, id: u64) {
        let mut starting = self.starting.lock();
        match starting.get_mut(&id) {
            Some(pending) => pending.abandoned = true,
            None => {
                drop(starting);
                self.release(id);
            }
        }
    }
}

/// Abandons its acquire when dropped before being disarmed
struct StartGuard {
    inner: Arc<PoolInner>,
    id: u64,
    armed: bool,
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        if self.armed {
            debug!("[pool] acquire {} abandoned while starting", self.id);
            self.inner.abandon(self.id);
        }
    }
}

/// Shared handle to the session pool
#[derive(Clone)]
pub struct ChrootPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ChrootPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChrootPool")
            .field("max_sessions", &self.inner.max_sessions)
            .field("active", &self.active_sessions())
            .finish_non_exhaustive()
    }
}

impl ChrootPool {
    pub fn new(provider: Arc<dyn SessionProvider>, config: &PoolSection) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                provider,
                max_sessions: config.max_sessions_per_chroot.max(1),
                lease_ttl: config.lease_ttl(),
                hosted: RwLock::new(HashMap::new()),
                starting: Mutex::new(HashMap::new()),
                leases: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        }
    }

    /// Offer sessions on an Active chroot
    pub fn host(&self, key: ChrootKey, chroot: &str, backend: BackendKind) {
        let mut hosted = self.inner.hosted.write();
        match hosted.get_mut(&key) {
            Some(existing) => {
                existing.chroot = chroot.to_string();
                existing.backend = backend;
            }
            None => {
                info!("[pool] hosting {} as {}", key, chroot);
                hosted.insert(
                    key,
                    Hosted {
                        chroot: chroot.to_string(),
                        backend,
                        semaphore: Arc::new(Semaphore::new(self.inner.max_sessions)),
                    },
                );
            }
        }
    }

    /// Stop offering sessions; leased sessions stay valid, waiters fail
    pub fn unhost(&self, key: &ChrootKey) {
        if let Some(hosted) = self.inner.hosted.write().remove(key) {
            hosted.semaphore.close();
            info!("[pool] no longer hosting {}", key);
        }
    }

    pub fn is_hosted(&self, codename: &str, architecture: &str) -> bool {
        self.inner
            .hosted
            .read()
            .contains_key(&ChrootKey::new(codename, architecture))
    }

    pub fn hosted(&self) -> Vec<ChrootKey> {
        let mut keys: Vec<_> = self.inner.hosted.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Sessions that could be started right now on `key`
    pub fn available(&self, key: &ChrootKey) -> usize {
        self.inner
            .hosted
            .read()
            .get(key)
            .map(|h| h.semaphore.available_permits())
            .unwrap_or(0)
    }

    /// Free sessions summed over all hosted chroots
    pub fn free_capacity(&self) -> usize {
        self.inner
            .hosted
            .read()
            .values()
            .map(|h| h.semaphore.available_permits())
            .sum()
    }

    pub fn max_sessions(&self) -> usize {
        self.inner.max_sessions
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.leases.lock().len()
    }

    /// (sessions handed out, sessions released) since start
    pub fn counters(&self) -> (u64, u64) {
        (
            self.inner.acquired.load(Ordering::SeqCst),
            self.inner.released.load(Ordering::SeqCst),
        )
    }

    /// Lease a fresh session, waiting at most `timeout` for a free slot
    ///
    /// Fails with `Capacity` when the pair is not hosted or the backend cannot
    /// start another session, and with `Timeout` when no slot frees up.
    pub async fn acquire(
        &self,
        codename: &str,
        architecture: &str,
        timeout: Duration,
        owner: &str,
    ) -> Result<ChrootSession> {
        let key = ChrootKey::new(codename, architecture);
        let (chroot, backend, semaphore) = {
            let hosted = self.inner.hosted.read();
            let h = hosted
                .get(&key)
                .ok_or_else(|| Error::Capacity(format!("no active chroot for {}", key)))?;
            (h.chroot.clone(), h.backend, Arc::clone(&h.semaphore))
        };

        let permit = match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(Error::Capacity(format!("chroot {} was withdrawn", key)));
            }
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "no free session for {} within {}s",
                    key,
                    timeout.as_secs()
                )));
            }
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.inner.lease_ttl)
                .unwrap_or_else(|_| chrono::Duration::days(1));

        // The lease is recorded by the blocking task itself. A caller that
        // stops waiting drops the guard, and the task then ends the session
        // instead of leasing it.
        self.inner.starting.lock().insert(
            id,
            Starting {
                owner: owner.to_string(),
                abandoned: false,
            },
        );
        let mut guard = StartGuard {
            inner: Arc::clone(&self.inner),
            id,
            armed: true,
        };
        let inner = Arc::clone(&self.inner);
        let lease_key = key.clone();
        let lease_owner = owner.to_string();
        let lease_chroot = chroot.clone();
        let started = tokio::task::spawn_blocking(move || {
            let begun = inner.provider.begin(&lease_chroot);
            let mut starting = inner.starting.lock();
            let abandoned = starting.remove(&id).is_none_or(|s| s.abandoned);
            let backend_session = begun?;
            if abandoned {
                drop(starting);
                if let Err(e) = inner.provider.end(&backend_session) {
                    warn!("[pool] ending abandoned session {} failed: {}", backend_session, e);
                }
                return Err(Error::Capacity(format!(
                    "session {} on {} abandoned by {}",
                    backend_session, lease_key, lease_owner
                )));
            }
            inner.leases.lock().insert(
                id,
                Lease {
                    key: lease_key,
                    backend_session: backend_session.clone(),
                    owner: lease_owner,
                    expires_at,
                    _permit: permit,
                },
            );
            inner.acquired.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>(backend_session)
        })
        .await;
        guard.armed = false;
        let backend_session = started
            .map_err(|e| Error::IoError(format!("session start task failed: {}", e)))?
            .map_err(|e| Error::Capacity(format!("cannot start session on {}: {}", chroot, e)))?;

        debug!("[pool] session {} ({}) leased to {}", id, key, owner);
        Ok(ChrootSession {
            id,
            key,
            chroot,
            backend_session,
            backend,
            owner: owner.to_string(),
            expires_at,
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// End a session; returns false if it was already released
    pub fn release(&self, session: &ChrootSession) -> bool {
        self.inner.release(session.id)
    }

    /// Release every session leased to `owner`
    ///
    /// Sessions of `owner` that are still starting are ended once they
    /// come up; they are not counted.
    pub fn release_owned_by(&self, owner: &str) -> usize {
        for pending in self.inner.starting.lock().values_mut() {
            if pending.owner == owner {
                pending.abandoned = true;
            }
        }
        let ids: Vec<u64> = self
            .inner
            .leases
            .lock()
            .iter()
            .filter(|(_, lease)| lease.owner == owner)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter(|id| self.inner.release(*id)).count()
    }

    /// Release sessions whose lease ran out before `now`
    pub fn reap_expired(&self, now: DateTime<Utc>) -> usize {
        let ids: Vec<u64> = self
            .inner
            .leases
            .lock()
            .iter()
            .filter(|(_, lease)| lease.expires_at < now)
            .map(|(id, _)| *id)
            .collect();
        let reaped = ids.into_iter().filter(|id| self.inner.release(*id)).count();
        if reaped > 0 {
            warn!("[pool] reaped {} expired session(s)", reaped);
        }
        reaped
    }
}

/// One leased session; never cloned, released at most once
pub struct ChrootSession {
    id: u64,
    key: ChrootKey,
    chroot: String,
    backend_session: String,
    backend: BackendKind,
    owner: String,
    expires_at: DateTime<Utc>,
    pool: Weak<PoolInner>,
}

impl fmt::Debug for ChrootSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChrootSession")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("backend_session", &self.backend_session)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl ChrootSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &ChrootKey {
        &self.key
    }

    /// Name of the base chroot
    pub fn chroot(&self) -> &str {
        &self.chroot
    }

    /// The schroot name addressing this session
    pub fn schroot_name(&self) -> String {
        format!("session:{}", self.backend_session)
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Whether the pool still holds the lease
    pub fn is_leased(&self) -> bool {
        self.pool
            .upgrade()
            .map(|pool| pool.leases.lock().contains_key(&self.id))
            .unwrap_or(false)
    }
}

impl Drop for ChrootSession {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(self.id);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::pool_with;
    use super::*;
    use crate::chroot::sequence::testing::RecordingRunner;

    const SHORT: Duration = Duration::from_millis(50);

    fn hosted(max: usize) -> (ChrootPool, Arc<testing::CountingProvider>) {
        let (pool, provider) = pool_with(max);
        pool.host(ChrootKey::new("sid", "amd64"), "mbd-sid-amd64", BackendKind::Directory);
        (pool, provider)
    }

    #[tokio::test]
    async fn test_bound_and_timeout() {
        let (pool, _) = hosted(2);
        let a = pool.acquire("sid", "amd64", SHORT, "a").await.unwrap();
        let b = pool.acquire("sid", "amd64", SHORT, "b").await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.schroot_name(), b.schroot_name());

        let err = pool.acquire("sid", "amd64", SHORT, "c").await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        assert!(pool.release(&a));
        let c = pool.acquire("sid", "amd64", SHORT, "c").await.unwrap();
        assert_eq!(c.backend(), BackendKind::Directory);
        assert_eq!(pool.active_sessions(), 2);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (pool, provider) = hosted(1);
        let session = pool.acquire("sid", "amd64", SHORT, "x").await.unwrap();
        assert!(session.is_leased());
        assert!(pool.release(&session));
        assert!(!pool.release(&session));
        assert!(!session.is_leased());
        drop(session);

        assert_eq!(provider.ended.load(Ordering::SeqCst), 1);
        assert_eq!(pool.counters(), (1, 1));
        assert_eq!(pool.available(&ChrootKey::new("sid", "amd64")), 1);
    }

    #[tokio::test]
    async fn test_panicking_holder_releases_once() {
        let (pool, provider) = hosted(1);
        let p = pool.clone();
        let handle = tokio::spawn(async move {
            let _session = p.acquire("sid", "amd64", SHORT, "crash").await.unwrap();
            panic!("builder crashed");
        });
        assert!(handle.await.is_err());

        assert_eq!(pool.active_sessions(), 0);
        assert_eq!(provider.ended.load(Ordering::SeqCst), 1);
        assert!(pool.acquire("sid", "amd64", SHORT, "next").await.is_ok());
    }

    #[tokio::test]
    async fn test_unhosted_and_refused_are_capacity_errors() {
        let (pool, provider) = hosted(1);
        let err = pool.acquire("sid", "armel", SHORT, "x").await.unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));

        provider.refuse.store(true, Ordering::SeqCst);
        let err = pool.acquire("sid", "amd64", SHORT, "x").await.unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));
        // the slot came back
        assert_eq!(pool.available(&ChrootKey::new("sid", "amd64")), 1);
    }

    #[tokio::test]
    async fn test_unhost_wakes_waiters() {
        let (pool, _) = hosted(1);
        let _held = pool.acquire("sid", "amd64", SHORT, "a").await.unwrap();
        let p = pool.clone();
        let waiter =
            tokio::spawn(async move { p.acquire("sid", "amd64", Duration::from_secs(5), "b").await });
        tokio::task::yield_now().await;
        pool.unhost(&ChrootKey::new("sid", "amd64"));
        assert!(matches!(waiter.await.unwrap(), Err(Error::Capacity(_))));
        assert!(!pool.is_hosted("sid", "amd64"));
    }

    #[tokio::test]
    async fn test_reap_and_release_by_owner() {
        let (pool, _) = hosted(3);
        let a = pool.acquire("sid", "amd64", SHORT, "job-1").await.unwrap();
        let _b = pool.acquire("sid", "amd64", SHORT, "job-1").await.unwrap();
        let _c = pool.acquire("sid", "amd64", SHORT, "job-2").await.unwrap();

        assert_eq!(pool.release_owned_by("job-1"), 2);
        assert!(!a.is_leased());
        assert_eq!(pool.active_sessions(), 1);

        assert_eq!(pool.reap_expired(Utc::now()), 0);
        assert_eq!(pool.reap_expired(Utc::now() + chrono::Duration::days(2)), 1);
        assert_eq!(pool.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_cancel_while_session_starts() {
        let (pool, provider) = hosted(2);
        provider.begin_delay_ms.store(300, Ordering::SeqCst);
        let cancel = tokio_util::sync::CancellationToken::new();

        let p = pool.clone();
        let token = cancel.clone();
        let waiter = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => None,
                acquired = p.acquire("sid", "amd64", Duration::from_secs(5), "job-1") => Some(acquired),
            }
        });
        tokio::time::sleep(SHORT).await;
        cancel.cancel();
        assert!(waiter.await.unwrap().is_none());
        assert_eq!(pool.release_owned_by("job-1"), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(pool.active_sessions(), 0);
        assert_eq!(provider.begun.load(Ordering::SeqCst), 1);
        assert_eq!(provider.ended.load(Ordering::SeqCst), 1);
        assert_eq!(pool.available(&ChrootKey::new("sid", "amd64")), 2);
    }

    #[tokio::test]
    async fn test_release_by_owner_ends_starting_session() {
        let (pool, provider) = hosted(1);
        provider.begin_delay_ms.store(200, Ordering::SeqCst);

        let p = pool.clone();
        let acquire =
            tokio::spawn(async move { p.acquire("sid", "amd64", Duration::from_secs(5), "job-2").await });
        tokio::time::sleep(SHORT).await;
        pool.release_owned_by("job-2");

        assert!(matches!(acquire.await.unwrap(), Err(Error::Capacity(_))));
        assert_eq!(pool.active_sessions(), 0);
        assert_eq!(provider.ended.load(Ordering::SeqCst), 1);
        assert!(pool.acquire("sid", "amd64", SHORT, "next").await.is_ok());
    }

    #[test]
    fn test_schroot_sessions() {
        let runner = Arc::new(RecordingRunner::default());
        *runner.output.lock() = "mbd-sid-amd64-4a1c\n".into();
        let sessions = SchrootSessions::new(runner.clone());
        let id = sessions.begin("mbd-sid-amd64").unwrap();
        assert_eq!(id, "mbd-sid-amd64-4a1c");
        sessions.end(&id).unwrap();
        assert_eq!(
            runner.commands(),
            vec![
                "schroot --begin-session --chroot mbd-sid-amd64",
                "schroot --end-session --chroot session:mbd-sid-amd64-4a1c"
            ]
        );
    }
}
