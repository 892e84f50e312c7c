//! # Gesture Recognition Pipeline
//!
//! Data flow:
//! ```text
//! POST /features ─► ingest ─► feature queue ─► WindowAggregator ─► classify_window ─► result queue ─► GET /translation
//!                      └──── pre-batched window ──────────────────────┘
//! ```
//!
//! Request handlers only touch the pipeline through [`PipelineContext`] and the two bounded
//! queues it owns. The aggregator runs on its own OS thread and owns the sliding buffer.

pub mod aggregator;
pub mod classifier;
pub mod context;
pub mod frame;
pub mod ingest;
pub mod item;
pub mod policy;
pub mod publisher;
pub mod queue;
pub mod stats;

pub use aggregator::WindowAggregator;
pub use classifier::{Classifier, ClassifierLoader, LinearWindowClassifier};
pub use context::PipelineContext;
pub use ingest::{ingest, FeatureRequest};
