use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::recognition::RecognitionResult;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Latest completed recognition result per session.
///
/// Writers are recognition tasks, readers the display loop. The lock only
/// ever guards a map lookup and an `Arc` swap, so readers never wait on a
/// network call.
#[derive(Clone, Default)]
pub struct DetectionCache {
    slots: Arc<Mutex<HashMap<SessionId, Option<Arc<RecognitionResult>>>>>,
}

impl DetectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<SessionId, Option<Arc<RecognitionResult>>>> {
        // a panicking writer cannot leave a half written Arc behind
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn open(&self, session: SessionId) {
        self.slots().insert(session, None);
    }

    /// Overwrite the entry for a live session. Results for closed sessions
    /// are discarded and `false` is returned.
    pub fn update(&self, session: SessionId, result: RecognitionResult) -> bool {
        let result = Arc::new(result);
        match self.slots().get_mut(&session) {
            Some(slot) => {
                *slot = Some(result);
                true
            }
            None => false,
        }
    }

    pub fn read(&self, session: SessionId) -> Option<Arc<RecognitionResult>> {
        self.slots().get(&session).cloned().flatten()
    }

    pub fn is_open(&self, session: SessionId) -> bool {
        self.slots().contains_key(&session)
    }

    pub fn close(&self, session: SessionId) {
        self.slots().remove(&session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognition::Detection;
    use std::time::Duration;

    fn result(issued_for: u64, name: &str) -> RecognitionResult {
        RecognitionResult {
            issued_for,
            detections: vec![Detection::named(name)],
        }
    }

    #[test]
    fn starts_empty_and_overwrites() {
        let cache = DetectionCache::new();
        let session = SessionId::next();
        cache.open(session);
        assert!(cache.read(session).is_none());

        assert!(cache.update(session, result(1, "Amy")));
        assert!(cache.update(session, result(2, "Zoe")));
        assert_eq!(cache.read(session).unwrap().detections[0].name, "Zoe");
    }

    #[tokio::test]
    async fn last_completion_wins_over_issue_order() {
        let cache = DetectionCache::new();
        let session = SessionId::next();
        cache.open(session);

        // A is issued first but completes last
        let slow = {
            let cache = cache.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                cache.update(session, result(1, "Y"))
            })
        };
        let fast = {
            let cache = cache.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                cache.update(session, result(2, "X"))
            })
        };

        assert!(fast.await.unwrap());
        assert_eq!(cache.read(session).unwrap().detections[0].name, "X");
        assert!(slow.await.unwrap());

        let latest = cache.read(session).unwrap();
        assert_eq!(latest.detections[0].name, "Y");
        assert_eq!(latest.issued_for, 1);
    }

    #[test]
    fn closed_session_discards_late_results() {
        let cache = DetectionCache::new();
        let session = SessionId::next();
        cache.open(session);
        cache.close(session);

        assert!(!cache.update(session, result(1, "Amy")));
        assert!(cache.read(session).is_none());
        assert!(!cache.is_open(session));
    }

    #[test]
    fn sessions_are_isolated() {
        let cache = DetectionCache::new();
        let first = SessionId::next();
        let second = SessionId::next();
        cache.open(first);
        cache.open(second);
        cache.update(first, result(1, "Amy"));
        assert!(cache.read(second).is_none());
    }
}
