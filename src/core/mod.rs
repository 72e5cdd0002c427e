pub mod blobs;
pub mod checkpoint;
pub mod compose;
pub mod context;
pub mod conversation;
pub mod credentials;
pub mod error;
pub mod masking;
pub mod model;
pub mod oauth;
pub mod ports;
pub mod providers;
pub mod storage;
pub mod store;
pub mod template;
pub mod vault;
pub mod volumes;

#[cfg(test)]
pub(crate) mod testing;
