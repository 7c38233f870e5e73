//! Collaborator services the order-fulfillment steps call, with in-memory
//! implementations.

pub mod inventory;
pub mod orders;
pub mod payment;

pub use inventory::{InMemoryInventoryService, InventoryError, InventoryService, Reservation};
pub use orders::{InMemoryOrderStore, Order, OrderError, OrderStatus, OrderStore};
pub use payment::{InMemoryPaymentGateway, PaymentGateway, PaymentReceipt};
