use http::StatusCode;
use thiserror::Error;

pub mod forward;
pub mod selector;
pub mod singleflight;
pub mod weight;

pub use forward::{CacheStatus, Forwarder, ForwarderSettings};
pub use selector::{MirrorStatus, UpstreamSelector};
pub use singleflight::{Flight, FlightGuard, Group, Waiter};
pub use weight::{DynamicWeight, WeightPolicy, MIN_WEIGHT};

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("no upstream mirror available")]
    Unavailable,

    #[error("upstream attempts exhausted after {0} tries")]
    Exhausted(usize),
}

impl ForwardError {
    pub fn status(&self) -> StatusCode {
        match self {
            ForwardError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ForwardError::Exhausted(_) => StatusCode::BAD_GATEWAY,
        }
    }
}
