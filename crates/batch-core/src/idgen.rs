//! Opaque, collision-resistant id generation, injected so submission tests
//! can assert on deterministic ids.

use crate::model::BatchId;

pub trait IdGenerator: Send + Sync {
    fn new_batch_id(&self) -> BatchId;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn new_batch_id(&self) -> BatchId {
        BatchId::new()
    }
}
