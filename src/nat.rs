//! UDP session table.
//!
//! Maps the local signature of a UDP conversation to its outbound packet
//! session. The first packet of a conversation claims creation; packets
//! arriving while the session is being dialed wait on a per-key signal
//! instead of dialing again.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

use crate::error::{NatError, TunnelError};
use crate::outbound::PacketSession;

pub type Session = Arc<dyn PacketSession>;

pub struct NatTable {
    sessions: DashMap<String, Session>,
    /// Keys whose session is being created. The flag flips to `true` once
    /// the claimant is done, successful or not.
    pending: DashMap<String, watch::Receiver<bool>>,
    wait_timeout: Duration,
}

enum Claim {
    Wait(watch::Receiver<bool>),
    Create(watch::Sender<bool>),
}

/// Releases the pending marker when creation ends, however it ends.
struct CreationGuard<'a> {
    table: &'a NatTable,
    key: &'a str,
    done: watch::Sender<bool>,
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        self.table.pending.remove(self.key);
        let _ = self.done.send(true);
    }
}

impl NatTable {
    /// `wait_timeout` bounds how long a packet waits for another task to
    /// finish creating its session.
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            pending: DashMap::new(),
            wait_timeout,
        }
    }

    pub fn get(&self, key: &str) -> Option<Session> {
        self.sessions.get(key).map(|s| s.value().clone())
    }

    pub fn set(&self, key: &str, session: Session) {
        self.sessions.insert(key.to_string(), session);
    }

    /// Remove `key` only while it still maps to `session`.
    pub fn remove(&self, key: &str, session: &Session) -> bool {
        self.sessions
            .remove_if(key, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of keys with a creation in flight.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Existing session for `key`, or the one `create` produces.
    ///
    /// At most one `create` runs per key at a time. Callers that find a
    /// creation in flight wait for it and then look the key up once more;
    /// if the creator failed they get [`NatError::CreationFailed`]. The
    /// returned flag is true only for the caller that ran `create`.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: &str,
        create: F,
    ) -> Result<(Session, bool), TunnelError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Session, TunnelError>>,
    {
        if let Some(session) = self.get(key) {
            return Ok((session, false));
        }

        let claim = match self.pending.entry(key.to_string()) {
            Entry::Occupied(entry) => Claim::Wait(entry.get().clone()),
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(false);
                entry.insert(rx);
                Claim::Create(tx)
            }
        };

        match claim {
            Claim::Wait(mut done) => {
                // A dropped sender means the creator went away; the lookup
                // below decides either way.
                let timed_out = tokio::time::timeout(self.wait_timeout, done.wait_for(|done| *done))
                    .await
                    .is_err();
                if timed_out {
                    return Err(NatError::WaitTimeout(self.wait_timeout).into());
                }
                self.get(key)
                    .map(|session| (session, false))
                    .ok_or_else(|| NatError::CreationFailed.into())
            }
            Claim::Create(done) => {
                let _guard = CreationGuard {
                    table: self,
                    key,
                    done,
                };

                // The previous creator may have installed its session
                // between our first lookup and the claim.
                if let Some(session) = self.get(key) {
                    return Ok((session, false));
                }

                let session = create().await?;
                self.set(key, session.clone());
                Ok((session, true))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::outbound::RejectSession;

    fn session() -> Session {
        Arc::new(RejectSession)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_packets_share_one_session() {
        let table = Arc::new(NatTable::new(Duration::from_secs(5)));
        let creations = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let table = table.clone();
                let creations = creations.clone();
                tokio::spawn(async move {
                    table
                        .get_or_create("127.0.0.1:5000", || async move {
                            creations.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok(session())
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        let results: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(creations.load(Ordering::SeqCst), 1);
        assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
        let first = &results[0].0;
        assert!(results.iter().all(|(s, _)| Arc::ptr_eq(s, first)));
        assert_eq!(table.len(), 1);
        assert_eq!(table.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_creation_releases_waiters() {
        let table = Arc::new(NatTable::new(Duration::from_secs(5)));

        let creator = {
            let table = table.clone();
            tokio::spawn(async move {
                table
                    .get_or_create("k", || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Err(TunnelError::OutboundNotFound("P1".into()))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiter = table
            .get_or_create("k", || async { Ok(session()) })
            .await;

        assert!(matches!(
            waiter,
            Err(TunnelError::Session(NatError::CreationFailed))
        ));
        assert!(matches!(
            creator.await.unwrap(),
            Err(TunnelError::OutboundNotFound(_))
        ));
        assert!(table.is_empty());
        assert_eq!(table.pending(), 0);

        let (_, created) = table
            .get_or_create("k", || async { Ok(session()) })
            .await
            .unwrap();
        assert!(created);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn waiter_gives_up_after_timeout() {
        let table = Arc::new(NatTable::new(Duration::from_millis(50)));

        let creator = {
            let table = table.clone();
            tokio::spawn(async move {
                table
                    .get_or_create("k", || async {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        Ok(session())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiter = table
            .get_or_create("k", || async { Ok(session()) })
            .await;

        assert!(matches!(
            waiter,
            Err(TunnelError::Session(NatError::WaitTimeout(_)))
        ));
        assert!(creator.await.unwrap().unwrap().1);
    }

    #[test]
    fn remove_ignores_replaced_session() {
        let table = NatTable::new(Duration::from_secs(1));
        let old = session();
        let new = session();
        table.set("k", new.clone());

        assert!(!table.remove("k", &old));
        assert!(table.remove("k", &new));
        assert!(table.is_empty());
    }
}
