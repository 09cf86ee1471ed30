//! Outbox relay process wiring.

pub mod contracts;

use courier_events::TypeRegistry;

/// Suffix marking a message type as part of the external contract.
pub const INTEGRATION_EVENT_SUFFIX: &str = "IntegrationEvent";

/// Registry of every relayable contract in [`contracts::catalog`].
pub fn build_registry() -> TypeRegistry {
    let registry = TypeRegistry::new();
    registry.register_matching(contracts::catalog(), |shape| {
        shape.type_name().ends_with(INTEGRATION_EVENT_SUFFIX)
    });
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_holds_only_integration_events() {
        let registry = build_registry();

        assert_eq!(
            registry.tags(),
            vec![
                "billing.payment.received",
                "catalog.product.created",
                "catalog.product.deleted",
                "sales.order.placed",
            ]
        );
        assert!(registry.resolve("inventory.stock.low").is_none());
    }

    #[test]
    fn resolved_shapes_decode_stored_payloads() {
        let registry = build_registry();
        let shape = registry.resolve("catalog.product.created").unwrap();
        let payload = r#"{"product_id":"0190c6d2-6f00-7000-8000-000000000001","name":"Desk","price_cents":49900}"#;

        let message = shape.decode(payload).unwrap();
        let event = message
            .downcast_ref::<contracts::ProductCreatedIntegrationEvent>()
            .unwrap();
        assert_eq!(event.name, "Desk");
        assert_eq!(event.price_cents, 49_900);
    }
}
