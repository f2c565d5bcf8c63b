//! Out-of-band delivery of identity-verification tokens.
//!
//! The core only knows this trait; SMTP and friends are external
//! collaborators. The default for local development logs the payload instead
//! of sending anything.

use anyhow::Result;
use tracing::info;

/// One message to deliver to a user, out-of-band.
#[derive(Clone, Debug)]
pub struct Notification {
    pub username: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
}

pub trait Notifier: Send + Sync {
    /// Deliver a message or return an error to surface delivery failure.
    fn send(&self, notification: &Notification) -> Result<()>;
}

/// Local dev notifier that logs instead of delivering.
#[derive(Clone, Debug)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, notification: &Notification) -> Result<()> {
        info!(
            username = %notification.username,
            subject = %notification.subject,
            body = %notification.body,
            "notification send stub"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_notifier_accepts_messages() {
        let notifier = LogNotifier;
        let result = notifier.send(&Notification {
            username: "alice".to_string(),
            recipients: vec!["alice@example.com".to_string()],
            subject: "Password reset".to_string(),
            body: "token".to_string(),
        });
        assert!(result.is_ok());
    }
}
