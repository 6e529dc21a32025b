// services/notifications.rs
//
// Outbound domain events. Handlers emit events after their transaction has
// committed; a single dispatcher task turns them into SMS sends. A failed
// send is logged and dropped, it never propagates back into a request.
use reqwest::Client;
use rust_decimal::Decimal;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum DomainEvent {
    BookingCreated {
        booking_id: Uuid,
        customer_phone: String,
        location_name: String,
        scheduled_date: String,
    },
    BookingAccepted {
        booking_id: Uuid,
        customer_phone: String,
    },
    BookingCompleted {
        booking_id: Uuid,
        customer_phone: String,
        final_price: Decimal,
    },
    BookingCancelled {
        booking_id: Uuid,
        customer_phone: String,
    },
    PaymentSettled {
        booking_id: Uuid,
        customer_phone: String,
        amount: Decimal,
        receipt: Option<String>,
    },
    BankTransferSubmitted {
        booking_id: Uuid,
        amount: Decimal,
        bank_reference: String,
    },
}

impl DomainEvent {
    /// Recipient and message body for the SMS this event turns into.
    /// `admin_phone` receives operational alerts; an empty value drops them.
    pub fn render(&self, admin_phone: &str) -> Option<(String, String)> {
        match self {
            DomainEvent::BookingCreated {
                booking_id,
                customer_phone,
                location_name,
                scheduled_date,
            } => Some((
                customer_phone.clone(),
                format!(
                    "Booking #{} confirmed!\nDate: {}\nLocation: {}\nThank you for choosing our service.",
                    short_id(booking_id),
                    scheduled_date,
                    location_name
                ),
            )),
            DomainEvent::BookingAccepted {
                booking_id,
                customer_phone,
            } => Some((
                customer_phone.clone(),
                format!(
                    "Driver is on the way for booking #{}!",
                    short_id(booking_id)
                ),
            )),
            DomainEvent::BookingCompleted {
                booking_id,
                customer_phone,
                final_price,
            } => Some((
                customer_phone.clone(),
                format!(
                    "Service for booking #{} completed! Payment of KES {} has been recorded. Thank you for using UsafiLink.",
                    short_id(booking_id),
                    final_price
                ),
            )),
            DomainEvent::BookingCancelled {
                booking_id,
                customer_phone,
            } => Some((
                customer_phone.clone(),
                format!(
                    "Booking #{} was automatically cancelled as no driver accepted it within 24 hours.",
                    short_id(booking_id)
                ),
            )),
            DomainEvent::PaymentSettled {
                booking_id,
                customer_phone,
                amount,
                receipt,
            } => Some((
                customer_phone.clone(),
                format!(
                    "Payment of KES {} received!\nFor booking #{}\nReceipt: {}\nThank you!",
                    amount,
                    short_id(booking_id),
                    receipt.as_deref().unwrap_or("-")
                ),
            )),
            DomainEvent::BankTransferSubmitted {
                booking_id,
                amount,
                bank_reference,
            } => {
                if admin_phone.is_empty() {
                    return None;
                }
                Some((
                    admin_phone.to_string(),
                    format!(
                        "ALERT: New Bank Transfer Submission!\nAmount: KES {}\nRef: {}\nBooking: #{}\nPlease verify in Admin Dashboard.",
                        amount,
                        bank_reference,
                        short_id(booking_id)
                    ),
                ))
            }
        }
    }
}

fn short_id(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

#[derive(Clone)]
pub struct SmsClient {
    api_key: String,
    username: String,
    from: String,
    client: Client,
}

impl SmsClient {
    pub fn new(api_key: String, username: String, from: String) -> Self {
        Self {
            api_key,
            username,
            from,
            client: Client::new(),
        }
    }

    fn enabled(&self) -> bool {
        !self.api_key.is_empty()
    }

    pub async fn send_sms(&self, phone: &str, message: &str) -> anyhow::Result<()> {
        if !self.enabled() {
            info!("SMS disabled, would send to {}: {}", phone, message);
            return Ok(());
        }

        // Africa's Talking messaging API
        let url = "https://api.africastalking.com/version1/messaging";

        let response = self
            .client
            .post(url)
            .header("apiKey", &self.api_key)
            .header("Accept", "application/json")
            .form(&[
                ("username", self.username.as_str()),
                ("to", phone),
                ("message", message),
                ("from", self.from.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("SMS sending failed with status: {}", response.status());
        }

        Ok(())
    }
}

/// Consumes domain events until every sender is dropped. Runs outside any
/// database transaction; failures here cannot roll anything back.
pub async fn run_dispatcher(
    mut events: UnboundedReceiver<DomainEvent>,
    sms: SmsClient,
    admin_phone: String,
) {
    info!("Notification dispatcher started");
    while let Some(event) = events.recv().await {
        let Some((phone, message)) = event.render(&admin_phone) else {
            warn!("Dropping event with no recipient: {:?}", event);
            continue;
        };
        if let Err(e) = sms.send_sms(&phone, &message).await {
            error!("Notification send failed: {}", e);
        }
    }
    info!("Notification dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settled_event_renders_receipt() {
        let event = DomainEvent::PaymentSettled {
            booking_id: Uuid::new_v4(),
            customer_phone: "254712345678".to_string(),
            amount: Decimal::from(5000),
            receipt: Some("QWE123".to_string()),
        };
        let (phone, message) = event.render("").unwrap();
        assert_eq!(phone, "254712345678");
        assert!(message.contains("KES 5000"));
        assert!(message.contains("QWE123"));
    }

    #[test]
    fn bank_alert_needs_admin_phone() {
        let event = DomainEvent::BankTransferSubmitted {
            booking_id: Uuid::new_v4(),
            amount: Decimal::from(7500),
            bank_reference: "FT2024".to_string(),
        };
        assert!(event.render("").is_none());

        let (phone, message) = event.render("254700000001").unwrap();
        assert_eq!(phone, "254700000001");
        assert!(message.contains("FT2024"));
    }

    #[test]
    fn cancellation_notice_mentions_the_24h_window() {
        let event = DomainEvent::BookingCancelled {
            booking_id: Uuid::new_v4(),
            customer_phone: "254712345678".to_string(),
        };
        let (_, message) = event.render("").unwrap();
        assert!(message.contains("24 hours"));
    }
}
