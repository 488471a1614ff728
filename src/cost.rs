//! Token cost of a completed call, by response status class.
//!
//! | status              | tokens |
//! |---------------------|--------|
//! | 2xx                 | 2      |
//! | 3xx                 | 1      |
//! | 4xx except 429      | 5      |
//! | 429, 5xx, other     | 0      |

/// Tokens charged for a 2xx response.
pub const SUCCESS_COST: u32 = 2;
/// Tokens charged for a 3xx response (mostly `304 Not Modified`).
pub const REDIRECT_COST: u32 = 1;
/// Tokens charged for a 4xx response other than 429.
pub const CLIENT_ERROR_COST: u32 = 5;

/// Cost a request is assumed to have before its status is known.
pub const EXPECTED_COST: u32 = SUCCESS_COST;

/// Map an HTTP status code to the number of tokens the call consumed.
pub fn token_cost(status: u16) -> u32 {
    match status {
        200..=299 => SUCCESS_COST,
        300..=399 => REDIRECT_COST,
        429 => 0,
        400..=499 => CLIENT_ERROR_COST,
        _ => 0,
    }
}
