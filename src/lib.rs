#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod error;
pub use error::*;

mod common;
pub use common::*;

mod clock;
pub use clock::*;

mod metrics;
pub use metrics::*;

mod store;
pub use store::*;

mod limiter;
pub use limiter::*;

mod service;
pub use service::*;

#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
mod config;
#[cfg(feature = "server")]
pub use config::*;

#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod http;
#[cfg(feature = "server")]
pub use http::HttpOptions;

#[cfg(test)]
mod tests;
