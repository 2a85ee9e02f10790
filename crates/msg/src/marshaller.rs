//! Payload codec contract and the name-to-type registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::payload::{Command, Event, Failure, Named, Payload, Reply, Success};
use crate::{MsgError, Result};

/// Converts payload value trees to bytes and back.
///
/// The codec works on a self-describing [`Value`] so that it can stay object
/// safe; the registry turns values into concrete types.
pub trait Marshaller: Send + Sync {
    fn marshal(&self, value: &Value) -> Result<Vec<u8>>;

    fn unmarshal(&self, data: &[u8]) -> Result<Value>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMarshaller;

impl Marshaller for JsonMarshaller {
    fn marshal(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(data)?)
    }
}

type Decoder = fn(Value) -> serde_json::Result<Box<dyn Payload>>;

fn decode_as<T>(value: Value) -> serde_json::Result<Box<dyn Payload>>
where
    T: Payload + DeserializeOwned,
{
    Ok(Box::new(serde_json::from_value::<T>(value)?))
}

/// Registry of every payload type a process can decode, keyed by wire name.
///
/// Built once at startup with [`TypeRegistryBuilder`] and shared read-only
/// (behind an `Arc`) by publishers, dispatchers, orchestrators and stores.
pub struct TypeRegistry {
    marshaller: Box<dyn Marshaller>,
    decoders: HashMap<&'static str, Decoder>,
}

impl TypeRegistry {
    /// Starts a registry using the JSON codec, with the generic
    /// [`Success`] and [`Failure`] replies already registered.
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::new()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.decoders.contains_key(name)
    }

    /// Serializes any payload with the registry's codec.
    pub fn serialize(&self, value: &dyn Payload) -> Result<Vec<u8>> {
        let tree = value.to_value()?;
        self.marshaller.marshal(&tree)
    }

    /// Decodes `data` into the type registered under `name`.
    pub fn deserialize(&self, name: &str, data: &[u8]) -> Result<Box<dyn Payload>> {
        let decoder = self
            .decoders
            .get(name)
            .ok_or_else(|| MsgError::UnregisteredType(name.to_string()))?;
        let tree = self.marshaller.unmarshal(data)?;
        Ok(decoder(tree)?)
    }

    /// Decodes `data` stored under `name` directly into `T`.
    ///
    /// Fails when `name` is not registered or names a different type.
    pub fn deserialize_as<T>(&self, name: &str, data: &[u8]) -> Result<T>
    where
        T: Named + DeserializeOwned,
    {
        if !self.is_registered(name) {
            return Err(MsgError::UnregisteredType(name.to_string()));
        }
        if name != T::NAME {
            return Err(MsgError::TypeMismatch {
                expected: T::NAME,
                found: name.to_string(),
            });
        }
        let tree = self.marshaller.unmarshal(data)?;
        Ok(serde_json::from_value(tree)?)
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.decoders.keys().collect();
        names.sort();
        f.debug_struct("TypeRegistry")
            .field("types", &names)
            .finish()
    }
}

/// Builder for [`TypeRegistry`].
pub struct TypeRegistryBuilder {
    marshaller: Box<dyn Marshaller>,
    decoders: HashMap<&'static str, Decoder>,
}

impl TypeRegistryBuilder {
    fn new() -> Self {
        Self {
            marshaller: Box::new(JsonMarshaller),
            decoders: HashMap::new(),
        }
        .register_reply::<Success>()
        .register_reply::<Failure>()
    }

    /// Replaces the codec.
    pub fn marshaller(mut self, marshaller: impl Marshaller + 'static) -> Self {
        self.marshaller = Box::new(marshaller);
        self
    }

    /// Registers any named type, such as saga data.
    pub fn register<T>(mut self) -> Self
    where
        T: Named + Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    {
        if self.decoders.insert(T::NAME, decode_as::<T>).is_some() {
            tracing::warn!(type_name = T::NAME, "type registered more than once");
        }
        self
    }

    pub fn register_command<C: Command>(self) -> Self {
        self.register::<C>()
    }

    pub fn register_event<E: Event>(self) -> Self {
        self.register::<E>()
    }

    pub fn register_reply<R: Reply>(self) -> Self {
        self.register::<R>()
    }

    /// Freezes the registry.
    pub fn build(self) -> Arc<TypeRegistry> {
        tracing::info!(types = self.decoders.len(), "type registry built");
        Arc::new(TypeRegistry {
            marshaller: self.marshaller,
            decoders: self.decoders,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct CreditReserved {
        reservation_id: String,
    }

    impl Named for CreditReserved {
        const NAME: &'static str = "customer.CreditReserved";
    }

    impl Reply for CreditReserved {}

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct OrderData {
        order_id: String,
    }

    impl Named for OrderData {
        const NAME: &'static str = "order.OrderData";
    }

    #[test]
    fn test_builder_registers_generic_replies() {
        let registry = TypeRegistry::builder().build();
        assert!(registry.is_registered(Success::NAME));
        assert!(registry.is_registered(Failure::NAME));
    }

    #[test]
    fn test_deserialize_by_name() {
        let registry = TypeRegistry::builder()
            .register_reply::<CreditReserved>()
            .build();
        let reply = CreditReserved {
            reservation_id: "r-1".into(),
        };

        let bytes = registry.serialize(&reply).unwrap();
        let decoded = registry.deserialize(CreditReserved::NAME, &bytes).unwrap();

        assert_eq!(decoded.payload_name(), CreditReserved::NAME);
        assert_eq!(decoded.downcast_ref::<CreditReserved>(), Some(&reply));
    }

    #[test]
    fn test_unknown_name_is_rejected() {
        let registry = TypeRegistry::builder().build();
        let result = registry.deserialize("nobody.Knows", b"{}");
        assert!(matches!(result, Err(MsgError::UnregisteredType(name)) if name == "nobody.Knows"));
    }

    #[test]
    fn test_undecodable_payload_is_a_serialization_error() {
        let registry = TypeRegistry::builder()
            .register_reply::<CreditReserved>()
            .build();
        let result = registry.deserialize(CreditReserved::NAME, b"not json");
        assert!(matches!(result, Err(MsgError::Serialization(_))));
    }

    #[test]
    fn test_deserialize_as_checks_name() {
        let registry = TypeRegistry::builder()
            .register::<OrderData>()
            .register_reply::<CreditReserved>()
            .build();
        let bytes = registry
            .serialize(&OrderData {
                order_id: "o-1".into(),
            })
            .unwrap();

        let data: OrderData = registry.deserialize_as(OrderData::NAME, &bytes).unwrap();
        assert_eq!(data.order_id, "o-1");

        let mismatch = registry.deserialize_as::<OrderData>(CreditReserved::NAME, &bytes);
        assert!(matches!(mismatch, Err(MsgError::TypeMismatch { .. })));
    }
}
