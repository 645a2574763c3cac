//! Utilities for testing relay functionality without real network timing: a socket that
//!  delivers a prepared script of datagrams on tokio's (pausable) clock, and builders for
//!  protocol packets. They are part of the regular (non-#[cfg(test)]) code so integration
//!  tests can use them as well.

pub mod packets;
pub mod scripted_socket;
