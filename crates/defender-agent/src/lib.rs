//! Device-side defender agent.
//!
//! The agent periodically enumerates the device's established TCP
//! connections, builds a report containing the fields selected in its
//! [`metrics::MetricsRegistry`], publishes it through a [`transport::Connector`]
//! and reports whether the service accepted it, rejected it (for example when
//! throttled) or could not be reached.

pub mod agent;
pub mod classifier;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod http;
pub mod metrics;
pub mod report;
pub mod transport;


pub use agent::{Defender, StartInfo};
pub use error::{DefenderError, Result};
pub use event::{DefenderEvent, EventKind, EventSink, RejectReason};
