// Recently seen message ids
//
// After a cursor resume the bus may replay events this daemon already
// handled. The claim would reject them anyway; remembering ids avoids the
// round-trip and keeps the logs quiet.

use dashmap::DashMap;
use std::time::{Duration, Instant};

pub const DEFAULT_SEEN_WINDOW: Duration = Duration::from_secs(600);

pub struct SeenMessages {
    seen: DashMap<String, Instant>,
    window: Duration,
}

impl SeenMessages {
    pub fn new(window: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            window,
        }
    }

    /// Record `id`. Returns true the first time an id is seen within the window.
    pub fn first_sighting(&self, id: &str) -> bool {
        let now = Instant::now();
        self.prune(now);
        match self.seen.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) >= self.window {
                    entry.insert(now);
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    /// Forget `id` so a later sighting is processed again.
    pub fn forget(&self, id: &str) {
        self.seen.remove(id);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn prune(&self, now: Instant) {
        let window = self.window;
        self.seen.retain(|_, at| now.duration_since(*at) < window);
    }
}

impl Default for SeenMessages {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_WINDOW)
    }
}
