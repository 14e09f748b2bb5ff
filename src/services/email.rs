use lettre::{
    Message, SmtpTransport, Transport,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use log::{error, info, warn};
use std::sync::Arc;

/// Email delivery boundary. Delivery is best-effort: a failed send is logged
/// and reported as `false`, never propagated, so an already-issued
/// verification code stays durable whether or not the message went out.
#[rocket::async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> bool;
}

pub type SharedMailer = Arc<dyn Mailer>;

pub struct SmtpMailer;

#[rocket::async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> bool {
        match try_send(to, subject, html_body) {
            Ok(()) => {
                info!("Email sent successfully to {}", to);
                true
            }
            Err(e) => {
                error!("Failed to send email to {}: {}", to, e);
                false
            }
        }
    }
}

fn try_send(to: &str, subject: &str, html_body: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mail_user = crate::config::Config::mail_user();
    let mail_password = crate::config::Config::mail_password();

    if mail_user.is_empty() || mail_password.is_empty() {
        warn!("Email credentials not configured. Skipping email send.");
        return Err("Email not configured".into());
    }

    let from_mailbox: Mailbox = crate::config::Config::mail_from().parse()?;
    let to_mailbox: Mailbox = to.parse()?;

    let message = Message::builder()
        .from(from_mailbox)
        .to(to_mailbox)
        .subject(subject)
        .header(ContentType::TEXT_HTML)
        .body(html_body.to_string())?;

    let creds = Credentials::new(mail_user, mail_password);
    let mailer = SmtpTransport::relay(&crate::config::Config::mail_host())?
        .credentials(creds)
        .build();

    mailer.send(&message)?;
    Ok(())
}

pub const WELCOME_SUBJECT: &str = "Welcome to Tanzania Diaspora UAE";

pub fn welcome_email_html(first_name: &str, member_number: &str) -> String {
    let display_name = if first_name.is_empty() {
        "there"
    } else {
        first_name
    };

    format!(
        r#"
        <!DOCTYPE html>
        <html>
        <body style='font-family: Arial, sans-serif; line-height: 1.6; color: #333;'>
            <h1>Welcome to Tanzania Diaspora UAE!</h1>
            <p>Hi {},</p>
            <p>Your email has been verified and your membership is now active.</p>
            <p>Your member number is <strong>{}</strong>. Keep it handy when
            contacting the association or booking services.</p>
            <p>Best regards,<br><strong>Tanzania Diaspora UAE</strong></p>
        </body>
        </html>
        "#,
        display_name, member_number
    )
}
