//! Request middleware shared by the REST API and the media bridge upgrade.

pub mod logging;
pub mod metrics;

pub use logging::RequestLogging;
pub use metrics::MetricsMiddleware;
