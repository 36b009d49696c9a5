pub mod blocking;
pub mod context;
pub mod entry;
pub mod error;
pub mod events;
pub mod expiry;
pub mod factory;
pub mod meat;
pub mod priority;
pub mod return_data;
pub mod storage;
pub mod storage_id;
pub mod timestamp;
