use jobagent_core::{config::EmailConfig, mail::Mailer, Result, StepStatus};
use tracing::{debug, info};

/// Mailer that records each message in the log instead of delivering it.
pub struct LogMailer {
    from: String,
}

impl LogMailer {
    pub fn new(config: &EmailConfig) -> Self {
        Self {
            from: config.from.clone(),
        }
    }
}

impl Mailer for LogMailer {
    fn send(&self, to: &[String], subject: &str, body: &str) -> Result<()> {
        info!(from = %self.from, to = %to.join(", "), %subject, "mail handed off");
        debug!(%body, "mail body");
        Ok(())
    }
}

/// Substitute the configured status, job-name and step-name tokens.
pub fn render_template(
    template: &str,
    tokens: &EmailConfig,
    status: StepStatus,
    job_name: &str,
    step_name: &str,
) -> String {
    let mut text = template.to_string();
    for (token, value) in [
        (tokens.status_token.as_str(), status.name()),
        (tokens.job_name_token.as_str(), job_name),
        (tokens.step_name_token.as_str(), step_name),
    ] {
        if !token.is_empty() {
            text = text.replace(token, value);
        }
    }
    text
}
