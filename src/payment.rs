use rand::Rng;
use ulid::Ulid;

use crate::model::Cents;

/// Input to a payment attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentRequest {
    /// Defaults to the booking total.
    pub amount: Option<Cents>,
    /// Defaults to `MOCK_PAYMENT`.
    pub method: Option<String>,
    pub card_number: Option<String>,
}

/// Decides whether a payment attempt goes through. Stands in for a gateway.
pub trait PaymentDecider: Send + Sync {
    fn approve(&self, request: &PaymentRequest) -> bool;
}

/// Cards ending in an even digit succeed, odd digits fail. Without a usable
/// card number the outcome is random with `success_rate` odds.
#[derive(Debug, Clone, Copy)]
pub struct CardParityDecider {
    pub success_rate: f64,
}

impl Default for CardParityDecider {
    fn default() -> Self {
        Self { success_rate: 0.8 }
    }
}

impl PaymentDecider for CardParityDecider {
    fn approve(&self, request: &PaymentRequest) -> bool {
        let last_digit = request
            .card_number
            .as_deref()
            .and_then(|card| card.trim().chars().last())
            .and_then(|c| c.to_digit(10));
        match last_digit {
            Some(d) => d % 2 == 0,
            None if self.success_rate.is_nan() => false,
            None => rand::thread_rng().gen_bool(self.success_rate.clamp(0.0, 1.0)),
        }
    }
}

/// Always answers the same way. Handy for tests and dry runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedDecider(pub bool);

impl PaymentDecider for FixedDecider {
    fn approve(&self, _request: &PaymentRequest) -> bool {
        self.0
    }
}

/// `TXN-` followed by the random tail of a fresh ULID.
pub fn new_tx_ref() -> String {
    let id = Ulid::new().to_string();
    format!("TXN-{}", &id[16..])
}
