use crate::error::Result;

/// Outbound notification sink used by step e-mail annotations.
///
/// Callers treat delivery as fire-and-forget: an `Err` is logged and never
/// changes a step's outcome.
pub trait Mailer: Send + Sync {
    fn send(&self, to: &[String], subject: &str, body: &str) -> Result<()>;
}
