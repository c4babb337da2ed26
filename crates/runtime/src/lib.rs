//! Chart data runtime: cache-aware query result retrieval.
//!
//! This crate holds everything behind the chart REST surface: query context
//! validation, cache keys, the result cache, query execution, result
//! encoding, async jobs, chart commands and screenshots.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │ ChartDataGateway │──── async ───▶ AsyncQueryManager ──▶ job workers
//! └────────┬─────────┘                                          │
//!          │ sync                                               │
//!   ┌──────┴───────────┐                                        │
//!   │ ChartDataCommand │◀───────────────────────────────────────┘
//!   └──┬────────────┬──┘
//!      │            │
//! ResultCache   QueryEngine (DataFusion)
//! ```

pub mod async_queries;
pub mod cache;
pub mod cache_key;
pub mod charts;
pub mod command;
pub mod engine;
pub mod formatter;
pub mod gateway;
pub mod query_context;
pub mod result;
pub mod screenshots;

pub use cache::{MokaResultCache, ResultCache};
pub use command::{ChartDataCommand, CommandSettings};
pub use engine::{DataFusionEngine, QueryEngine};
pub use gateway::{ChartDataGateway, ChartDataOutcome};
pub use query_context::{validate_query_context, QueryContext, ResultFormat, ResultType};
