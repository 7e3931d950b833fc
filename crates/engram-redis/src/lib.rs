mod store;

pub use store::{RedisPayloadStore, RedisStoreConfig};
