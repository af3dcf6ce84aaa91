//! A revocable pool of API-key-bound clients.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tinify_client::{Client, ClientError, ClientOptions};

type Entries = Arc<Mutex<HashMap<String, Option<Arc<Client>>>>>;

/// A multiset of clients keyed by API key.
///
/// Clients are instantiated lazily on the first [`ClientPool::get`] that
/// picks their key. Revoking a key removes it for the lifetime of the
/// pool; a revoked key never reappears within a run.
#[derive(Debug)]
pub struct ClientPool {
    options: ClientOptions,
    entries: Entries,
}

/// Removes one specific key from the pool it was handed out by.
///
/// Calling [`RevokeHandle::revoke`] more than once is equivalent to
/// calling it once.
#[derive(Debug)]
pub struct RevokeHandle {
    key: String,
    entries: Entries,
}

impl RevokeHandle {
    /// Permanently removes the key from the pool.
    pub fn revoke(self) {
        self.entries.lock().unwrap().remove(&self.key);
    }
}

impl ClientPool {
    /// Creates a pool over the given keys. Duplicate keys collapse into
    /// one entry.
    pub fn new(keys: impl IntoIterator<Item = impl Into<String>>, options: ClientOptions) -> Self {
        let entries = keys.into_iter().map(|key| (key.into(), None)).collect();
        Self {
            options,
            entries: Arc::new(Mutex::new(entries)),
        }
    }

    /// Hands out an arbitrary live client together with a handle that
    /// revokes its key. Returns `None` when no keys are left.
    ///
    /// The selection among live keys is unspecified; callers must not
    /// assume an order.
    pub fn get(&self) -> Result<Option<(Arc<Client>, RevokeHandle)>, ClientError> {
        let mut entries = self.entries.lock().unwrap();
        let Some((key, slot)) = entries.iter_mut().next() else {
            return Ok(None);
        };

        let client = match slot {
            Some(client) => Arc::clone(client),
            None => {
                let client = Arc::new(Client::new(key.clone(), &self.options)?);
                *slot = Some(Arc::clone(&client));
                client
            }
        };

        let handle = RevokeHandle {
            key: key.clone(),
            entries: Arc::clone(&self.entries),
        };
        Ok(Some((client, handle)))
    }

    /// Number of keys still live in the pool.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether all keys have been revoked (or none were provided).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
