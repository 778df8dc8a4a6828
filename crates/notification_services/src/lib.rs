//! # Notification Services
//!
//! Channel senders for availability notifications. Each delivery channel
//! (email, SMS, WhatsApp) sits behind its own trait so the dispatcher can
//! fan out to whichever channels a subscription has enabled without caring
//! about the transport underneath.

/// Channel sender traits and mock implementations
pub mod senders;
/// Error types shared by all channel senders
pub mod types;

/// AWS SES / SNS backed senders for email and SMS
pub mod aws;
/// Twilio-backed sender for WhatsApp
pub mod twilio;

pub use aws::{SesEmailSender, SnsSmsSender};
pub use senders::{
    EmailSender, MockEmailSender, MockSmsSender, MockWhatsappSender, SmsSender, WhatsappSender,
};
pub use twilio::TwilioWhatsappSender;
pub use types::{ChannelError, format_e164};
