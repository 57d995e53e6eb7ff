//! Tiered Cache Core
//!
//! The engine and its leaf components: entry envelope, partition
//! registry, compression codec, dependency graph, and the background
//! sweeper.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         CacheEngine                              │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  L1 (memory)   │ L2 (persistent) │ L3 (cluster) │ L4 (edge)      │
//! │  partitioned   │ envelope files  │ hash-placed  │ TTL-on-read    │
//! │  maps + LRU    │ + index         │ nodes        │ objects        │
//! │        │                │               │              │         │
//! │        └────────────────┴───────┬───────┴──────────────┘         │
//! │                                 │                                │
//! │     FailoverController (per-tier breakers, emergency mode)       │
//! │     MonitoringService (rolling windows, threshold alerts)        │
//! │     DependencyGraph (cascade invalidation)                       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod compression;
pub mod depgraph;
pub mod engine;
pub mod entry;
pub mod partition;
mod sweeper;

pub use compression::{CompressionCodec, CompressionConfig, Compressor};
pub use depgraph::DependencyGraph;
pub use engine::{CacheEngine, EngineSnapshot};
pub use entry::{CacheKey, EntryEnvelope, TierMask};
pub use partition::{EvictionMode, PartitionConfig, PartitionRegistry};
