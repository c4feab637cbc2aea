//! Rate limiting for inbound participant messages

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Create a rate limiter with the specified requests per second
pub fn create_limiter(requests_per_second: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Max client messages per second per connection
pub const MESSAGE_RATE_LIMIT: u32 = 20;

/// Per-connection limiter
#[derive(Clone)]
pub struct ParticipantRateLimiter {
    messages: Arc<Limiter>,
}

impl ParticipantRateLimiter {
    pub fn new() -> Self {
        Self {
            messages: create_limiter(MESSAGE_RATE_LIMIT),
        }
    }

    /// Returns true if the message is allowed
    pub fn check_message(&self) -> bool {
        self.messages.check().is_ok()
    }
}

impl Default for ParticipantRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
