//! marketindex-evm — EVM log source, simulated chain and the ingestion
//! pipeline.

pub mod builder;
pub mod fetcher;
pub mod mock;
pub mod pipeline;
pub mod rpc;
pub mod source;

pub use builder::IndexerBuilder;
pub use fetcher::LogFetcher;
pub use mock::MockChain;
pub use pipeline::{Pipeline, PipelineStats, StopHandle};
pub use rpc::{HttpLogSource, HttpSourceConfig};
pub use source::{BlockStream, LogSource};
