pub mod catalog;
pub mod discovery;
pub mod driver;
pub mod gateway;
pub mod metrics;
pub mod parser;
pub mod protocol;
pub mod register;
pub mod service;

pub(crate) use catalog::*;
pub(crate) use discovery::DiscoverySettings;
pub(crate) use driver::{AckPolicy, Driver, Transport, TransportError};
pub(crate) use metrics::Metrics;
pub(crate) use service::*;
