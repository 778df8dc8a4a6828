use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ses::Client as SesClient;
use aws_sdk_sns::Client as SnsClient;

use crate::senders::{EmailSender, SmsSender};
use crate::types::{ChannelError, format_e164};

/// Email sender backed by AWS SES.
#[derive(Debug, Clone)]
pub struct SesEmailSender {
    client: SesClient,
    from_email: String,
}

impl SesEmailSender {
    /// Create a sender from the ambient AWS credential chain.
    pub async fn new() -> Result<Self, ChannelError> {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let client = SesClient::new(&config);

        let from_email = std::env::var("FROM_EMAIL")
            .map_err(|_| ChannelError::NotConfigured("FROM_EMAIL".to_string()))?;

        Ok(Self { client, from_email })
    }
}

#[async_trait]
impl EmailSender for SesEmailSender {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<String, ChannelError> {
        let subject_content = aws_sdk_ses::types::Content::builder()
            .data(subject)
            .build()
            .map_err(|e| ChannelError::Ses(format!("Failed to build subject: {}", e)))?;

        let text_content = aws_sdk_ses::types::Content::builder()
            .data(body)
            .build()
            .map_err(|e| ChannelError::Ses(format!("Failed to build text body: {}", e)))?;

        let message = aws_sdk_ses::types::Message::builder()
            .subject(subject_content)
            .body(aws_sdk_ses::types::Body::builder().text(text_content).build())
            .build();

        let destination = aws_sdk_ses::types::Destination::builder()
            .to_addresses(to)
            .build();

        log::info!("📧 Sending availability email to {} via AWS SES", to);

        let result = self
            .client
            .send_email()
            .source(&self.from_email)
            .destination(destination)
            .message(message)
            .send()
            .await;

        match result {
            Ok(output) => Ok(output.message_id().to_string()),
            Err(e) => {
                let error_msg = if let Some(service_error) = e.as_service_error() {
                    format!("AWS SES service error: {:?}", service_error)
                } else {
                    format!("AWS SES error: {}", e)
                };
                log::error!("❌ {}", error_msg);
                Err(ChannelError::Ses(error_msg))
            }
        }
    }
}

/// SMS sender backed by AWS SNS.
#[derive(Debug, Clone)]
pub struct SnsSmsSender {
    client: SnsClient,
}

impl SnsSmsSender {
    /// Create a sender from the ambient AWS credential chain.
    pub async fn new() -> Result<Self, ChannelError> {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Ok(Self {
            client: SnsClient::new(&config),
        })
    }
}

#[async_trait]
impl SmsSender for SnsSmsSender {
    async fn send_sms(&self, to: &str, message: &str) -> Result<String, ChannelError> {
        let formatted_phone = format_e164(to)?;

        let output = self
            .client
            .publish()
            .phone_number(&formatted_phone)
            .message(message)
            .send()
            .await
            .map_err(|e| ChannelError::Sns(e.to_string()))?;

        log::info!("📱 SMS sent to {}", formatted_phone);

        Ok(output
            .message_id()
            .map(str::to_string)
            .unwrap_or_else(|| "sns-no-message-id".to_string()))
    }
}
