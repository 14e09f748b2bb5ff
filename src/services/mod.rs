pub mod email;
pub mod otp;

pub use email::{Mailer, SharedMailer, SmtpMailer};
pub use otp::OtpService;
