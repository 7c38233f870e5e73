//! Payment gateway trait and in-memory implementation.
//!
//! The gateway is an external system reached synchronously, so its errors
//! use the breaker's [`CallError`] classification.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use circuit_breaker::CallError;
use common::CorrelationId;
use serde::{Deserialize, Serialize};

/// Receipt of a successful charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub payment_id: String,
    pub amount_cents: i64,
}

/// Trait for the external payment gateway.
///
/// Both operations are idempotent per correlation id.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Charges a customer for an order.
    async fn charge(
        &self,
        correlation_id: &CorrelationId,
        customer_id: &str,
        amount_cents: i64,
    ) -> Result<PaymentReceipt, CallError>;

    /// Refunds a previous charge in full.
    async fn refund(
        &self,
        correlation_id: &CorrelationId,
        payment_id: &str,
        amount_cents: i64,
    ) -> Result<(), CallError>;
}

#[derive(Debug, Default)]
struct GatewayState {
    payments: HashMap<CorrelationId, PaymentReceipt>,
    refunds: HashMap<CorrelationId, String>,
    next_id: u32,
    charge_script: VecDeque<CallError>,
    refund_script: VecDeque<CallError>,
    charge_failure: Option<CallError>,
    refund_failure: Option<CallError>,
    latency: Duration,
    charge_calls: u32,
    refund_calls: u32,
}

/// In-memory payment gateway for testing and the demo binary.
///
/// Failures are injected either as a script consumed call by call, or as a
/// persistent failure returned until cleared.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentGateway {
    state: Arc<RwLock<GatewayState>>,
}

impl InMemoryPaymentGateway {
    /// Creates a new in-memory payment gateway.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues errors returned by the next charge calls, in order.
    pub fn script_charges(&self, errors: impl IntoIterator<Item = CallError>) {
        self.write().charge_script.extend(errors);
    }

    /// Queues errors returned by the next refund calls, in order.
    pub fn script_refunds(&self, errors: impl IntoIterator<Item = CallError>) {
        self.write().refund_script.extend(errors);
    }

    /// Fails every charge with `error` until cleared with `None`.
    pub fn set_charge_failure(&self, error: Option<CallError>) {
        self.write().charge_failure = error;
    }

    /// Fails every refund with `error` until cleared with `None`.
    pub fn set_refund_failure(&self, error: Option<CallError>) {
        self.write().refund_failure = error;
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.write().latency = latency;
    }

    /// Returns the number of charges not refunded.
    pub fn payment_count(&self) -> usize {
        let state = self.read();
        state
            .payments
            .keys()
            .filter(|order| !state.refunds.contains_key(*order))
            .count()
    }

    /// Returns true if the order's charge was refunded.
    pub fn is_refunded(&self, correlation_id: &CorrelationId) -> bool {
        self.read().refunds.contains_key(correlation_id)
    }

    pub fn charge_calls(&self) -> u32 {
        self.read().charge_calls
    }

    pub fn refund_calls(&self) -> u32 {
        self.read().refund_calls
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, GatewayState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, GatewayState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    async fn simulate_latency(&self) {
        let latency = self.read().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn charge(
        &self,
        correlation_id: &CorrelationId,
        _customer_id: &str,
        amount_cents: i64,
    ) -> Result<PaymentReceipt, CallError> {
        self.write().charge_calls += 1;
        self.simulate_latency().await;

        let mut state = self.write();
        if let Some(error) = state.charge_script.pop_front() {
            return Err(error);
        }
        if let Some(error) = state.charge_failure.clone() {
            return Err(error);
        }

        if let Some(existing) = state.payments.get(correlation_id) {
            return Ok(existing.clone());
        }

        state.next_id += 1;
        let receipt = PaymentReceipt {
            payment_id: format!("PAY-{:04}", state.next_id),
            amount_cents,
        };
        state
            .payments
            .insert(correlation_id.clone(), receipt.clone());
        Ok(receipt)
    }

    async fn refund(
        &self,
        correlation_id: &CorrelationId,
        payment_id: &str,
        _amount_cents: i64,
    ) -> Result<(), CallError> {
        self.write().refund_calls += 1;
        self.simulate_latency().await;

        let mut state = self.write();
        if let Some(error) = state.refund_script.pop_front() {
            return Err(error);
        }
        if let Some(error) = state.refund_failure.clone() {
            return Err(error);
        }

        match state.payments.get(correlation_id) {
            Some(receipt) if receipt.payment_id == payment_id => {
                state
                    .refunds
                    .insert(correlation_id.clone(), payment_id.to_string());
                Ok(())
            }
            _ => Err(CallError::Permanent(format!(
                "unknown payment '{payment_id}'"
            ))),
        }
    }
}
