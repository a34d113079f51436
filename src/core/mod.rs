pub mod engine;
pub mod fetcher;
pub mod manifest;
pub mod probe;
pub mod provisioning;
pub mod storage_link;
pub mod supervisor;
