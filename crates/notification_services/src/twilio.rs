use async_trait::async_trait;
use reqwest::Client;

use crate::senders::WhatsappSender;
use crate::types::{ChannelError, format_e164};

/// WhatsApp sender backed by the Twilio messaging API.
pub struct TwilioWhatsappSender {
    client: Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl TwilioWhatsappSender {
    /// Create a sender from `TWILIO_*` environment variables.
    pub fn new() -> Result<Self, ChannelError> {
        let account_sid = std::env::var("TWILIO_ACCOUNT_SID")
            .map_err(|_| ChannelError::NotConfigured("TWILIO_ACCOUNT_SID".to_string()))?;
        let auth_token = std::env::var("TWILIO_AUTH_TOKEN")
            .map_err(|_| ChannelError::NotConfigured("TWILIO_AUTH_TOKEN".to_string()))?;
        let from_number = std::env::var("TWILIO_WHATSAPP_NUMBER")
            .map_err(|_| ChannelError::NotConfigured("TWILIO_WHATSAPP_NUMBER".to_string()))?;

        Ok(Self {
            client: Client::new(),
            account_sid,
            auth_token,
            from_number,
        })
    }
}

#[async_trait]
impl WhatsappSender for TwilioWhatsappSender {
    async fn send_whatsapp(&self, to: &str, message: &str) -> Result<String, ChannelError> {
        let formatted_phone = format_e164(to)?;

        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            self.account_sid
        );

        let params = [
            ("To", format!("whatsapp:{}", formatted_phone)),
            ("From", format!("whatsapp:{}", self.from_number)),
            ("Body", message.to_string()),
        ];

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await
            .map_err(|e| ChannelError::Twilio(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::error!("❌ Twilio WhatsApp send failed ({}): {}", status, body);
            return Err(ChannelError::Twilio(format!("HTTP {}", status)));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ChannelError::Twilio(format!("failed to parse response: {}", e)))?;

        let sid = body
            .get("sid")
            .and_then(|v| v.as_str())
            .unwrap_or("twilio-no-sid")
            .to_string();

        log::info!("💬 WhatsApp sent to {}, SID: {}", formatted_phone, sid);
        Ok(sid)
    }
}
