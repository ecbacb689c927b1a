//! Media library backend: a durable SQLite task queue driving ingest,
//! thumbnailing, hashing, captioning, embedding, face clustering and video
//! segmentation, plus vector search over the resulting embeddings.

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod faces;
pub mod index;
pub mod logging;
pub mod media;
pub mod metrics;
pub mod providers;
pub mod search;
pub mod tasks;
