pub mod member;
pub mod otp;

pub use member::*;
pub use otp::*;
