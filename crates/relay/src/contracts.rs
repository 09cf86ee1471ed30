//! Integration-event contracts relayed by this binary.
//!
//! Tags are part of the wire contract: renaming a struct is fine, changing a
//! tag orphans every stored record that carries the old one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::AggregateId;
use courier_events::{Event, MessageShape};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductCreatedIntegrationEvent {
    pub product_id: AggregateId,
    pub name: String,
    pub price_cents: i64,
}

impl Event for ProductCreatedIntegrationEvent {
    const TYPE_TAG: &'static str = "catalog.product.created";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductDeletedIntegrationEvent {
    pub product_id: AggregateId,
}

impl Event for ProductDeletedIntegrationEvent {
    const TYPE_TAG: &'static str = "catalog.product.deleted";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlacedIntegrationEvent {
    pub order_id: AggregateId,
    pub customer_id: AggregateId,
    pub total_cents: i64,
    pub placed_at: DateTime<Utc>,
}

impl Event for OrderPlacedIntegrationEvent {
    const TYPE_TAG: &'static str = "sales.order.placed";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentReceivedIntegrationEvent {
    pub order_id: AggregateId,
    pub amount_cents: i64,
}

impl Event for PaymentReceivedIntegrationEvent {
    const TYPE_TAG: &'static str = "billing.payment.received";
}

/// Raised for in-process listeners only; never relayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockLowNotification {
    pub product_id: AggregateId,
    pub on_hand: u32,
}

impl Event for StockLowNotification {
    const TYPE_TAG: &'static str = "inventory.stock.low";
}

/// Every message shape this deployment knows about.
pub fn catalog() -> Vec<MessageShape> {
    vec![
        MessageShape::of::<ProductCreatedIntegrationEvent>(),
        MessageShape::of::<ProductDeletedIntegrationEvent>(),
        MessageShape::of::<OrderPlacedIntegrationEvent>(),
        MessageShape::of::<PaymentReceivedIntegrationEvent>(),
        MessageShape::of::<StockLowNotification>(),
    ]
}
