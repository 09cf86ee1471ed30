//! Type registry: stable type tag → message shape.
//!
//! Built once at startup by explicit registration, then queried by the
//! publisher workers on every record. Lookups are a single hash probe; there is
//! no scanning or runtime type discovery on the hot path.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use thiserror::Error;
use tracing::debug;

use crate::event::{Event, Message};

type DecodeFn = fn(&str) -> Result<Box<dyn Message>, serde_json::Error>;

/// How to rebuild one concrete message type from its stored payload.
#[derive(Debug, Clone, Copy)]
pub struct MessageShape {
    tag: &'static str,
    type_name: &'static str,
    decode: DecodeFn,
}

impl MessageShape {
    /// Shape of the event type `E`.
    pub fn of<E: Event>() -> Self {
        Self {
            tag: E::TYPE_TAG,
            type_name: short_type_name(std::any::type_name::<E>()),
            decode: decode_as::<E>,
        }
    }

    /// The tag the shape was declared with.
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    /// Unqualified Rust type name (e.g. `ProductCreatedIntegrationEvent`).
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Deserialize `payload` into this shape.
    pub fn decode(&self, payload: &str) -> Result<Box<dyn Message>, RegistryError> {
        (self.decode)(payload).map_err(|source| RegistryError::Decode {
            type_name: self.type_name,
            source,
        })
    }
}

fn decode_as<E: Event>(payload: &str) -> Result<Box<dyn Message>, serde_json::Error> {
    let event: E = serde_json::from_str(payload)?;
    Ok(Box::new(event))
}

fn short_type_name(full: &'static str) -> &'static str {
    // Generic parameters would contain `::` too; event types are not generic.
    full.rsplit("::").next().unwrap_or(full)
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("payload does not match {type_name}: {source}")]
    Decode {
        type_name: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Thread-safe tag → shape map.
///
/// Registration is expected once during process initialization; reads happen
/// continuously from publisher workers. Registering the same tag twice keeps
/// the last shape.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    shapes: RwLock<HashMap<String, MessageShape>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `shape` under `tag`.
    pub fn register(&self, tag: impl Into<String>, shape: MessageShape) {
        let tag = tag.into();
        debug!(tag = %tag, type_name = shape.type_name(), "registering message shape");
        self.write().insert(tag, shape);
    }

    /// Register the event type `E` under its own tag.
    pub fn register_event<E: Event>(&self) {
        let shape = MessageShape::of::<E>();
        self.register(shape.tag(), shape);
    }

    /// Register every shape from `source` accepted by `predicate`.
    ///
    /// Returns how many shapes were registered.
    pub fn register_matching<I, P>(&self, source: I, predicate: P) -> usize
    where
        I: IntoIterator<Item = MessageShape>,
        P: Fn(&MessageShape) -> bool,
    {
        let accepted: Vec<MessageShape> = source.into_iter().filter(|s| predicate(s)).collect();
        let mut shapes = self.write();
        for shape in &accepted {
            shapes.insert(shape.tag().to_string(), *shape);
        }
        debug!(count = accepted.len(), "registered matching message shapes");
        accepted.len()
    }

    pub fn resolve(&self, tag: &str) -> Option<MessageShape> {
        self.read().get(tag).copied()
    }

    /// All registered shapes, sorted by tag.
    pub fn shapes(&self) -> Vec<(String, MessageShape)> {
        let mut all: Vec<_> = self
            .read()
            .iter()
            .map(|(tag, shape)| (tag.clone(), *shape))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn tags(&self) -> Vec<String> {
        self.shapes().into_iter().map(|(tag, _)| tag).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, MessageShape>> {
        self.shapes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, MessageShape>> {
        self.shapes.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::event::fixtures::*;

    fn catalog() -> Vec<MessageShape> {
        vec![
            MessageShape::of::<ProductCreatedIntegrationEvent>(),
            MessageShape::of::<ProductDeletedIntegrationEvent>(),
            MessageShape::of::<StockLowNotification>(),
        ]
    }

    #[test]
    fn resolves_registered_tags_only() {
        let registry = TypeRegistry::new();
        registry.register_event::<ProductCreatedIntegrationEvent>();

        let shape = registry.resolve("catalog.product.created").unwrap();
        assert_eq!(shape.type_name(), "ProductCreatedIntegrationEvent");
        assert!(registry.resolve("catalog.product.deleted").is_none());
    }

    #[test]
    fn decodes_payload_into_resolved_shape() {
        let registry = TypeRegistry::new();
        registry.register_event::<ProductCreatedIntegrationEvent>();

        let payload = serde_json::to_string(&product_created()).unwrap();
        let message = registry
            .resolve(ProductCreatedIntegrationEvent::TYPE_TAG)
            .unwrap()
            .decode(&payload)
            .unwrap();

        assert_eq!(message.downcast_ref::<ProductCreatedIntegrationEvent>(), Some(&product_created()));
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        let shape = MessageShape::of::<ProductCreatedIntegrationEvent>();

        let err = shape.decode(r#"{"product_id": 7}"#).unwrap_err();
        assert!(err.to_string().starts_with("payload does not match ProductCreatedIntegrationEvent"));
    }

    #[test]
    fn register_matching_filters_by_predicate() {
        let registry = TypeRegistry::new();

        let count = registry.register_matching(catalog(), |s| s.type_name().ends_with("IntegrationEvent"));

        assert_eq!(count, 2);
        assert_eq!(
            registry.tags(),
            vec!["catalog.product.created".to_string(), "catalog.product.deleted".to_string()]
        );
        assert!(registry.resolve(StockLowNotification::TYPE_TAG).is_none());
    }

    #[test]
    fn last_registration_for_a_tag_wins() {
        let registry = TypeRegistry::new();
        registry.register("legacy.tag", MessageShape::of::<ProductCreatedIntegrationEvent>());
        registry.register("legacy.tag", MessageShape::of::<ProductDeletedIntegrationEvent>());

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.resolve("legacy.tag").unwrap().type_name(),
            "ProductDeletedIntegrationEvent"
        );
    }

    #[test]
    fn concurrent_reads_during_registration() {
        let registry = Arc::new(TypeRegistry::new());
        registry.register_event::<ProductCreatedIntegrationEvent>();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        assert!(registry.resolve(ProductCreatedIntegrationEvent::TYPE_TAG).is_some());
                    }
                })
            })
            .collect();

        registry.register_event::<ProductDeletedIntegrationEvent>();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(registry.len(), 2);
    }
}
