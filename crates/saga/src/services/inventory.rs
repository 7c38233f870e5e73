//! Inventory service trait and in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::CorrelationId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::LineItem;

/// A successful inventory reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: String,
    pub items: Vec<LineItem>,
}

/// Errors reported by the inventory service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InventoryError {
    /// Not enough stock; a business failure.
    #[error("insufficient stock for '{sku}'")]
    OutOfStock { sku: String },

    /// The service could not be reached.
    #[error("inventory service unavailable: {0}")]
    Unavailable(String),
}

/// Trait for inventory management operations.
///
/// Both operations are idempotent per correlation id.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Reserves stock for every line of an order.
    async fn reserve(
        &self,
        correlation_id: &CorrelationId,
        items: &[LineItem],
    ) -> Result<Reservation, InventoryError>;

    /// Releases a reservation, returning its stock.
    async fn release(
        &self,
        correlation_id: &CorrelationId,
        reservation_id: &str,
    ) -> Result<(), InventoryError>;
}

#[derive(Debug, Default)]
struct InventoryState {
    stock: HashMap<String, u32>,
    reservations: HashMap<CorrelationId, Reservation>,
    released: HashMap<CorrelationId, String>,
    next_id: u32,
    reserve_outages: u32,
    release_outages: u32,
    reserve_calls: u32,
    release_calls: u32,
}

/// In-memory inventory service for testing and the demo binary.
///
/// SKUs with no stock entry are treated as unlimited.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InventoryState>>,
}

impl InMemoryInventoryService {
    /// Creates a new in-memory inventory service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the available quantity for a SKU.
    pub fn set_stock(&self, sku: impl Into<String>, quantity: u32) {
        self.write().stock.insert(sku.into(), quantity);
    }

    /// Makes the next `count` reserve calls fail as unavailable.
    pub fn fail_next_reserves(&self, count: u32) {
        self.write().reserve_outages = count;
    }

    /// Makes the next `count` release calls fail as unavailable.
    pub fn fail_next_releases(&self, count: u32) {
        self.write().release_outages = count;
    }

    /// Returns the available quantity for a SKU, if tracked.
    pub fn stock(&self, sku: &str) -> Option<u32> {
        self.read().stock.get(sku).copied()
    }

    /// Returns the number of active reservations.
    pub fn reservation_count(&self) -> usize {
        self.read().reservations.len()
    }

    /// Returns true if the order holds an active reservation.
    pub fn has_reservation(&self, correlation_id: &CorrelationId) -> bool {
        self.read().reservations.contains_key(correlation_id)
    }

    pub fn reserve_calls(&self) -> u32 {
        self.read().reserve_calls
    }

    pub fn release_calls(&self) -> u32 {
        self.read().release_calls
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InventoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InventoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn reserve(
        &self,
        correlation_id: &CorrelationId,
        items: &[LineItem],
    ) -> Result<Reservation, InventoryError> {
        let mut state = self.write();
        state.reserve_calls += 1;

        if state.reserve_outages > 0 {
            state.reserve_outages -= 1;
            return Err(InventoryError::Unavailable("connection refused".into()));
        }

        if let Some(existing) = state.reservations.get(correlation_id) {
            return Ok(existing.clone());
        }

        // Lines may repeat a SKU; check the per-SKU totals before taking anything
        let mut wanted: BTreeMap<&str, u32> = BTreeMap::new();
        for item in items {
            let total = wanted.entry(item.sku.as_str()).or_default();
            *total = total.saturating_add(item.quantity);
        }
        for (&sku, &quantity) in &wanted {
            if let Some(&available) = state.stock.get(sku)
                && available < quantity
            {
                return Err(InventoryError::OutOfStock {
                    sku: sku.to_string(),
                });
            }
        }
        for (sku, quantity) in wanted {
            if let Some(available) = state.stock.get_mut(sku) {
                *available -= quantity;
            }
        }

        state.next_id += 1;
        let reservation = Reservation {
            reservation_id: format!("RES-{:04}", state.next_id),
            items: items.to_vec(),
        };
        state
            .reservations
            .insert(correlation_id.clone(), reservation.clone());

        Ok(reservation)
    }

    async fn release(
        &self,
        correlation_id: &CorrelationId,
        reservation_id: &str,
    ) -> Result<(), InventoryError> {
        let mut state = self.write();
        state.release_calls += 1;

        if state.release_outages > 0 {
            state.release_outages -= 1;
            return Err(InventoryError::Unavailable("connection refused".into()));
        }

        if state.released.contains_key(correlation_id) {
            return Ok(());
        }

        if let Some(reservation) = state.reservations.remove(correlation_id) {
            for item in &reservation.items {
                if let Some(available) = state.stock.get_mut(&item.sku) {
                    *available = available.saturating_add(item.quantity);
                }
            }
        }
        state
            .released
            .insert(correlation_id.clone(), reservation_id.to_string());
        Ok(())
    }
}
