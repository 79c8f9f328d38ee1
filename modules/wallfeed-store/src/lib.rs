pub mod error;
#[cfg(feature = "test-utils")]
pub mod memory;
pub mod postgres;
pub mod traits;

pub use error::{Result, StoreError};
#[cfg(feature = "test-utils")]
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use traits::RecordStore;
