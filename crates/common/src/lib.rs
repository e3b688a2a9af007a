//! Common types shared by the token router crates

mod error;
pub mod region;
mod secret;

pub use error::{Error, Result};
pub use region::{RegionCode, assert_token_without_region_prefix, has_region_prefix};
pub use secret::{Secret, mask_token};
