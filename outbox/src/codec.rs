//! JSON payload codec.
//!
//! Payloads are persisted as an opaque serialized string plus a type tag.
//! The tag names the concrete payload type; typed handler adapters use it to
//! pick the right deserializer at dispatch time.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{DispatchError, OutboxResult};

/// A domain object that can travel through the outbox.
///
/// The `record_type` tag is stored on every record and must stay stable for
/// as long as undelivered records of this type may exist in the database.
/// Override it when the default (the Rust type path) is not stable enough,
/// e.g. across crate renames:
///
/// ```
/// use outbox::OutboxPayload;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct OrderCreated {
///     order_id: String,
/// }
///
/// impl OutboxPayload for OrderCreated {
///     fn record_type() -> &'static str {
///         "order.created"
///     }
/// }
/// ```
pub trait OutboxPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Fully qualified type tag stored on the record.
    fn record_type() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Serialize a payload into its `(record_type, json)` stored form.
///
/// Errors propagate to the scheduling caller: a payload that cannot be
/// serialized is never enqueued.
pub fn encode_payload<T: OutboxPayload>(payload: &T) -> OutboxResult<(String, String)> {
    let raw = serde_json::to_string(payload)?;
    Ok((T::record_type().to_string(), raw))
}

/// Deserialize a stored payload back into its concrete type.
///
/// Decode failures carry the `"SerializationError"` class so retry policies
/// can exclude them (re-dispatching a malformed payload never helps).
pub fn decode_payload<T: OutboxPayload>(raw: &str) -> Result<T, DispatchError> {
    serde_json::from_str(raw).map_err(|e| {
        DispatchError::with_class(
            "SerializationError",
            format!("cannot decode {}: {e}", T::record_type()),
        )
    })
}
