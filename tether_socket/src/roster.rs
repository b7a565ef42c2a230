use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use tether_core::Handle;

/// Thread-safe map of connected clients to their usernames.
#[derive(Default)]
pub struct Roster {
    names: RwLock<HashMap<Handle, String>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under a fresh random name and return it.
    pub fn join(&self, conn: Handle) -> String {
        let mut names = self.names.write();
        let mut rng = rand::thread_rng();
        let name = loop {
            let candidate = format!("user{}", rng.gen_range(0..100_000));
            if !names.values().any(|taken| *taken == candidate) {
                break candidate;
            }
        };
        names.insert(conn, name.clone());
        name
    }

    pub fn name(&self, conn: Handle) -> Option<String> {
        self.names.read().get(&conn).cloned()
    }

    /// Forget a connection, returning the name it had.
    pub fn leave(&self, conn: Handle) -> Option<String> {
        self.names.write().remove(&conn)
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }

    pub fn connections(&self) -> Vec<Handle> {
        self.names.read().keys().copied().collect()
    }
}
