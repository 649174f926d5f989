//! vulcan: CPU inference and training engine for small decoder-only
//! transformer language models.
//!
//! Three subsystems form the core: SIMD-friendly numeric kernels with
//! block-quantized weight formats, a budgeted KV-cache with LRU eviction
//! and prefix sharing, and a batched inference scheduler that streams
//! tokens per request. The same kernels back an autograd tape for
//! training.

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod kernels;
pub mod layers;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod quant;
pub mod scheduler;
pub mod tensor;
pub mod tokenizer;

pub use cache::{KvCacheStore, ModelShape, SessionId};
pub use config::{CacheConfig, CachePrecision, EngineConfig, SchedulerConfig};
pub use engine::{EngineStats, InferenceEngine};
pub use error::{VulcanError, VulcanResult};
pub use metrics::{LogMetrics, MetricsSink, NullMetrics};
pub use model::{ModelConfig, Transformer};
pub use quant::QuantScheme;
pub use scheduler::{GeneratedToken, SamplingOptions, TokenStream};
pub use tensor::{Parameter, Tensor};
pub use tokenizer::{ByteTokenizer, Tokenizer};
