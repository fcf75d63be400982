//! Caller identity. Tokens are verified upstream; this service only reads the
//! user id the gateway forwards.

pub(crate) mod extractors;
