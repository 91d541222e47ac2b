use gateway_core::now_millis;
use ulid::Ulid;

/// A published event wrapped with a stable id (for dedup) and timestamp.
#[derive(Clone, Debug)]
pub struct EventEnvelope<T> {
    pub id: String,
    pub emitted_at: u64,
    pub payload: T,
}

impl<T> EventEnvelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            id: Ulid::new().to_string(),
            emitted_at: now_millis(),
            payload,
        }
    }

    pub fn map<U>(&self, payload: U) -> EventEnvelope<U> {
        EventEnvelope {
            id: self.id.clone(),
            emitted_at: self.emitted_at,
            payload,
        }
    }
}
