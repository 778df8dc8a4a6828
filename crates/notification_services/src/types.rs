/// Errors raised by channel senders.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Simple email service (SES) errors.
    #[error("AWS SES error: {0}")]
    Ses(String),

    /// Simple notification service (SNS) errors.
    #[error("AWS SNS error: {0}")]
    Sns(String),

    /// Twilio API errors.
    #[error("Twilio error: {0}")]
    Twilio(String),

    /// Invalid phone number format.
    #[error("Invalid phone number format")]
    InvalidPhoneNumber,

    /// The send did not complete within the dispatcher's hard timeout.
    #[error("Channel send timed out")]
    Timeout,

    /// The sender is missing required configuration.
    #[error("Channel not configured: {0}")]
    NotConfigured(String),
}

/// Normalize a phone number to E.164, stripping common formatting.
pub fn format_e164(phone: &str) -> Result<String, ChannelError> {
    let formatted = if phone.starts_with('+') {
        phone.to_string()
    } else {
        format!("+{}", phone.replace(['(', ')', '-', ' ', '.'], ""))
    };

    if formatted.len() < 8 || !formatted[1..].chars().all(|c| c.is_ascii_digit()) {
        return Err(ChannelError::InvalidPhoneNumber);
    }

    Ok(formatted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_e164_strips_punctuation() {
        assert_eq!(format_e164("(415) 555-0123").unwrap(), "+4155550123");
        assert_eq!(format_e164("+14155550123").unwrap(), "+14155550123");
    }

    #[test]
    fn format_e164_rejects_garbage() {
        assert!(format_e164("not a phone").is_err());
        assert!(format_e164("+1").is_err());
    }
}
