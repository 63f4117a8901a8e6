use serde_json::Value;
use tokio::time::Instant;

/// A logical client engagement with one video and one parameter bag. A
/// session may spawn many jobs; each job snapshots the session's fields at
/// creation time.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    /// Name of a clip from the video catalogue.
    pub filename: String,
    /// Opaque parameter bag forwarded verbatim to workers.
    pub ammunition: Value,
    pub created_at: Instant,
    pub last_activity: Instant,
}

impl Session {
    pub fn new(id: String, filename: String, ammunition: Value) -> Self {
        let now = Instant::now();
        Self {
            id,
            filename,
            ammunition,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}
