use crate::sanitize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One mail transaction: the message lines received so far, with SMTP dot
/// transparency undone.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub id: String,
    pub lines: Vec<Vec<u8>>,
}

impl Session {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            lines: Vec::new(),
        }
    }

    /// Store one `data-line` payload. The lone `.` end marker is not stored
    /// and a leading `..` loses one dot.
    pub fn push_data_line(&mut self, payload: &[u8]) {
        if payload == b"." {
            return;
        }
        let line = if payload.starts_with(b"..") {
            &payload[1..]
        } else {
            payload
        };
        self.lines.push(line.to_vec());
    }
}

/// Sessions keyed by id. Each operation holds the map lock only for its own
/// duration; a session is then worked on through its own lock.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<Mutex<Session>>>>,
}

/// A panic while a lock was held leaves the data usable; take it back.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, id: &str) -> Arc<Mutex<Session>> {
        let mut sessions = lock(&self.sessions);
        sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                log::debug!("[{}] New session", sanitize::clean(id));
                Arc::new(Mutex::new(Session::new(id)))
            })
            .clone()
    }

    pub fn append_data_line(&self, id: &str, payload: &[u8]) {
        let session = self.get_or_create(id);
        lock(&session).push_data_line(payload);
    }

    /// Detach a session from the store, handing it to the caller.
    pub fn remove(&self, id: &str) -> Option<Arc<Mutex<Session>>> {
        lock(&self.sessions).remove(id)
    }

    pub fn delete(&self, id: &str) {
        if self.remove(id).is_some() {
            log::debug!("[{}] Session deleted", sanitize::clean(id));
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_dot_transparency() {
        let mut session = Session::new("abc");
        session.push_data_line(b"..hidden");
        session.push_data_line(b".");
        session.push_data_line(b"..");
        session.push_data_line(b"plain");
        session.push_data_line(b"");
        assert_eq!(
            session.lines,
            vec![b".hidden".to_vec(), b".".to_vec(), b"plain".to_vec(), Vec::new()]
        );
    }

    #[test]
    fn test_store_create_append_delete() {
        let store = SessionStore::new();
        assert!(store.is_empty());

        store.append_data_line("s1", b"Subject: one");
        store.append_data_line("s1", b"");
        store.append_data_line("s2", b"Subject: two");
        assert_eq!(store.len(), 2);

        let s1 = store.get_or_create("s1");
        assert_eq!(lock(&s1).lines.len(), 2);
        assert_eq!(lock(&s1).id, "s1");

        store.delete("s1");
        store.delete("s1");
        assert_eq!(store.len(), 1);

        let removed = store.remove("s2").unwrap();
        assert_eq!(lock(&removed).lines, vec![b"Subject: two".to_vec()]);
        assert!(store.remove("s2").is_none());
    }

    #[test]
    fn test_concurrent_appends() {
        let store = Arc::new(SessionStore::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..200 {
                        let id = format!("s{}", t % 4);
                        store.append_data_line(&id, format!("line {}", i).as_bytes());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 4);
        for s in 0..4 {
            let session = store.get_or_create(&format!("s{}", s));
            assert_eq!(lock(&session).lines.len(), 400);
        }
    }

    #[test]
    fn test_poisoned_session_recovered() {
        let store = Arc::new(SessionStore::new());
        store.append_data_line("p", b"before");

        let session = store.get_or_create("p");
        let result = thread::spawn(move || {
            let _guard = session.lock().unwrap();
            panic!("fault while holding the session");
        })
        .join();
        assert!(result.is_err());

        store.append_data_line("p", b"after");
        let session = store.get_or_create("p");
        assert_eq!(lock(&session).lines, vec![b"before".to_vec(), b"after".to_vec()]);
    }
}
