//! IdGenerator port
//!
//! Record ids, lock lease tokens and worker identities are ULIDs whose time
//! component comes from the injected `Clock`, so ids created under a
//! `ManualClock` still sort in the order the test intends.

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::ids::{LeaseToken, RecordId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_record_id(&self) -> RecordId;

    fn generate_lease_token(&self) -> LeaseToken;

    /// Opaque worker identity, `worker-<ulid>`.
    fn generate_worker_id(&self) -> String;
}

pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl IdGenerator for UlidGenerator {
    fn generate_record_id(&self) -> RecordId {
        RecordId::from(self.next_ulid())
    }

    fn generate_lease_token(&self) -> LeaseToken {
        LeaseToken::from(self.next_ulid())
    }

    fn generate_worker_id(&self) -> String {
        format!("worker-{}", self.next_ulid())
    }
}
