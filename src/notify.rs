// Two messages go out per accepted registration: a confirmation to the
// registrant and a notice to the admin address. Delivery is best-effort.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use html_escape::encode_safe;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::metrics::EMAIL_FAILURES;
use crate::models::{Registration, is_valid_email};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid recipient address: {0}")]
    InvalidRecipient(String),

    #[error("failed to run sendmail: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("sendmail exited with {0}")]
    Exit(std::process::ExitStatus),

    #[error("mail delivery timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub html_body: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &Email) -> Result<(), MailError>;
}

// Hands RFC 5322 messages to the local MTA, like PHP's mail()
pub struct SendmailMailer {
    program: PathBuf,
    from: String,
}

impl SendmailMailer {
    pub fn new(program: impl Into<PathBuf>, from: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            from: from.into(),
        }
    }

    fn render(&self, email: &Email) -> String {
        format!(
            "To: {}\r\nFrom: {}\r\nReply-To: {}\r\nSubject: {}\r\nMIME-Version: 1.0\r\nContent-Type: text/html; charset=UTF-8\r\n\r\n{}",
            header_value(&email.to),
            header_value(&self.from),
            header_value(&self.from),
            header_value(&email.subject),
            email.html_body
        )
    }
}

#[async_trait]
impl Mailer for SendmailMailer {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        let mut child = Command::new(&self.program)
            .arg("-t")
            .arg("-i")
            .arg("-f")
            .arg(&self.from)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            // a timed out send drops this future, the child must not outlive it
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(self.render(email).as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            warn!(
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "sendmail rejected message"
            );
            return Err(MailError::Exit(output.status));
        }
        Ok(())
    }
}

// Logs instead of delivering; used when no MTA is configured
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        info!(to = %email.to, subject = %email.subject, "email (log only)");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EventDetails {
    pub name: String,
    pub admin_email: String,
    pub fee_per_attendee: u64,
}

pub fn confirmation_email(event: &EventDetails, reg: &Registration) -> Email {
    let html_body = format!(
        "<html><body style='font-family:Arial,sans-serif;line-height:1.6;'>\n\
         <h2>Thank you for registering!</h2>\n\
         <p>Dear <strong>{name}</strong>,</p>\n\
         <p>Your registration for <strong>{event}</strong> has been received.</p>\n\
         <ul>\n\
         <li>Attendees: {attendees}</li>\n\
         <li>Fee: {fee} per person</li>\n\
         <li>Payment Method: {payment}</li>\n\
         <li>Total Amount: {total}</li>\n\
         </ul>\n\
         <p>Contact us at <strong>{admin}</strong> for assistance.</p>\n\
         </body></html>\n",
        name = encode_safe(&reg.full_name),
        event = encode_safe(&event.name),
        attendees = reg.attendees,
        fee = format_amount(event.fee_per_attendee),
        payment = encode_safe(&reg.payment_method),
        total = format_amount(reg.total_amount),
        admin = encode_safe(&event.admin_email),
    );

    Email {
        to: reg.email.clone(),
        subject: format!("Registration Confirmation - {}", event.name),
        html_body,
    }
}

pub fn admin_email(event: &EventDetails, reg: &Registration) -> Email {
    let html_body = format!(
        "<html><body style='font-family:Arial,sans-serif;line-height:1.6;'>\n\
         <h2>New Registration</h2>\n\
         <p><strong>Name:</strong> {name}<br>\n\
         <strong>Email:</strong> {email}<br>\n\
         <strong>Phone:</strong> {phone}<br>\n\
         <strong>Organization:</strong> {org}<br>\n\
         <strong>Attendees:</strong> {attendees}<br>\n\
         <strong>Payment Method:</strong> {payment}<br>\n\
         <strong>Total:</strong> {total}<br>\n\
         <strong>IP:</strong> {ip}</p>\n\
         </body></html>\n",
        name = encode_safe(&reg.full_name),
        email = encode_safe(&reg.email),
        phone = encode_safe(&reg.phone),
        org = encode_safe(&reg.organization),
        attendees = reg.attendees,
        payment = encode_safe(&reg.payment_method),
        total = format_amount(reg.total_amount),
        ip = encode_safe(&reg.remote_addr),
    );

    Email {
        to: event.admin_email.clone(),
        subject: format!("New Registration - {}", event.name),
        html_body,
    }
}

// Failures are logged and counted, never returned
pub async fn notify_registration(mailer: Arc<dyn Mailer>, event: &EventDetails, reg: &Registration) {
    for email in [confirmation_email(event, reg), admin_email(event, reg)] {
        if let Err(e) = deliver(mailer.as_ref(), &email).await {
            EMAIL_FAILURES.inc();
            warn!(to = %email.to, error = %e, "failed to send registration email");
        }
    }
}

async fn deliver(mailer: &dyn Mailer, email: &Email) -> Result<(), MailError> {
    if !is_valid_email(&email.to) {
        return Err(MailError::InvalidRecipient(email.to.clone()));
    }
    tokio::time::timeout(SEND_TIMEOUT, mailer.send(email))
        .await
        .map_err(|_| MailError::Timeout(SEND_TIMEOUT))?
}

// 60000 -> "60,000"
pub fn format_amount(amount: u64) -> String {
    let digits = amount.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn header_value(value: &str) -> String {
    value.chars().filter(|c| *c != '\r' && *c != '\n').collect()
}
