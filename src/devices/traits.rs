use async_trait::async_trait;

use crate::protocol::MemorySpace;
use crate::utils::error::Result;

/// Anything that can fetch a single register byte from the controller.
#[async_trait]
pub trait RegisterSource: Send + Sync {
    async fn read_register(&self, space: MemorySpace, address: u8) -> Result<u8>;
}
