//! Topic matching and subscription management
//!
//! Implements topic name/filter validation, filter matching and the shared
//! subscription registry used for fan-out.

mod registry;
pub mod validation;

pub use registry::{Subscribers, SubscriptionRegistry};
pub use validation::{
    topic_matches_filter, topic_matches_filter_with, validate_topic_filter, validate_topic_name,
    SegmentPolicy,
};
