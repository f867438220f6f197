#![forbid(unsafe_code)]

mod frame;
mod limiter;
mod pager;

pub use limiter::{IoLimiter, RateLimiter, Unlimited};
pub use pager::{PageCache, PageMut, PageRef, Pager, PagerOptions, PagerStats};
