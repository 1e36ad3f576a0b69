//! REST client
//!
//! Every request goes through [`RestExecutor::execute`], which applies the
//! global throttle and the per-route [`BucketRegistry`] before sending.

mod bucket;
mod executor;
mod gateway_info;
mod global;
pub mod headers;
mod registry;
pub mod route;

pub use bucket::{Admission, BucketSnapshot, RateLimitBucket};
pub use executor::{RequestPayload, RestExecutor, RestResponse, AUDIT_LOG_REASON};
pub use gateway_info::{fetch_gateway_bot, GatewayBotInfo, SessionStartLimit};
pub use global::GlobalThrottle;
pub use headers::{RateLimitHeaders, RateLimited};
pub use registry::{BucketPermit, BucketRegistry};
pub use route::{CompiledRoute, Route};
