use std::any::Any;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// An event that can travel through the outbox.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **self-describing** through a stable `TYPE_TAG`
/// - **serde-serializable** so they can be stored as JSON text and rebuilt later
///
/// The tag is what gets persisted next to the payload; renaming the Rust type is
/// safe, changing the tag is not.
pub trait Event: Serialize + DeserializeOwned + Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable type tag (e.g. "catalog.product.created").
    const TYPE_TAG: &'static str;
}

/// Type-erased view of an [`Event`].
///
/// Aggregates hold heterogeneous events in one buffer, and the publisher hands
/// decoded payloads to the broker without knowing their concrete type. Both go
/// through this trait.
pub trait Message: Any + core::fmt::Debug + Send + Sync {
    fn type_tag(&self) -> &'static str;

    /// Serialize the message body as JSON text.
    fn to_payload(&self) -> Result<String, serde_json::Error>;

    fn as_any(&self) -> &dyn Any;
}

impl<E: Event> Message for E {
    fn type_tag(&self) -> &'static str {
        E::TYPE_TAG
    }

    fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn Message {
    /// Recover the concrete event type, if it matches.
    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        self.as_any().downcast_ref::<E>()
    }
}
