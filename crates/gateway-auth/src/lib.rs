#![forbid(unsafe_code)]
//! Authentication and rate limiting (§4.9). Neither component touches
//! HTTP directly — `gateway-http` parses headers/peer addresses into a
//! [`Credential`] and a subject key, and calls into this crate.

mod authn;
mod rate_limit;

pub use authn::{Authenticator, Credential, Principal};
pub use rate_limit::{
    FixedWindowBackend, IncrementWithExpiry, RateLimitBackend, RateLimiterConfig,
    SlidingWindowRateLimiter,
};
