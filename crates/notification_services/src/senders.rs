use async_trait::async_trait;

use crate::types::ChannelError;

/// Email delivery capability. Returns a provider message id on success.
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Send a plain-text email.
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<String, ChannelError>;
}

/// SMS delivery capability. Returns a provider message id on success.
#[async_trait]
pub trait SmsSender: Send + Sync {
    /// Send a short text message.
    async fn send_sms(&self, to: &str, message: &str) -> Result<String, ChannelError>;
}

/// WhatsApp delivery capability. Returns a provider message id on success.
#[async_trait]
pub trait WhatsappSender: Send + Sync {
    /// Send a WhatsApp message.
    async fn send_whatsapp(&self, to: &str, message: &str) -> Result<String, ChannelError>;
}

/// Mock email sender for development/testing
pub struct MockEmailSender;

#[async_trait]
impl EmailSender for MockEmailSender {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<String, ChannelError> {
        log::info!("📧 [MOCK EMAIL] To: {}", to);
        log::info!("📧 [MOCK EMAIL] Subject: {}", subject);
        log::info!("📧 [MOCK EMAIL] Body:\n{}", body);

        Ok(format!("mock-email-{}", uuid::Uuid::new_v4()))
    }
}

/// Mock SMS sender for development/testing
pub struct MockSmsSender;

#[async_trait]
impl SmsSender for MockSmsSender {
    async fn send_sms(&self, to: &str, message: &str) -> Result<String, ChannelError> {
        log::info!("📱 [MOCK SMS] To: {}", to);
        log::info!("📱 [MOCK SMS] Message: {}", message);

        Ok(format!("mock-sms-{}", uuid::Uuid::new_v4()))
    }
}

/// Mock WhatsApp sender for development/testing
pub struct MockWhatsappSender;

#[async_trait]
impl WhatsappSender for MockWhatsappSender {
    async fn send_whatsapp(&self, to: &str, message: &str) -> Result<String, ChannelError> {
        log::info!("💬 [MOCK WHATSAPP] To: {}", to);
        log::info!("💬 [MOCK WHATSAPP] Message: {}", message);

        Ok(format!("mock-whatsapp-{}", uuid::Uuid::new_v4()))
    }
}
