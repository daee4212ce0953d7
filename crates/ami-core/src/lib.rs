//! Asterisk Manager Interface (AMI) client for the switchboard stack
//!
//! This crate owns everything wire-level: the line-oriented frame codec,
//! ActionID correlation between outbound actions and inbound frames, and a
//! persistent TCP link with login and reconnect handling.
//!
//! Higher layers depend on the [`AmiClient`] trait rather than the concrete
//! link, which keeps them testable against a scripted fake.

pub mod client;
pub mod correlator;
pub mod error;
pub mod frame;
pub mod link;

pub use client::{AmiClient, LinkStatus};
pub use correlator::ActionCorrelator;
pub use error::{AmiError, AmiResult};
pub use frame::{AmiAction, AmiEvent, AmiFrame, AmiResponse, Fields, FrameDecoder};
pub use link::{AmiLink, AmiLinkConfig};
