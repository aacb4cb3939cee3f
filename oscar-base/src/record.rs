use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

/// Self-describing, forward-compatible envelope for durable records.
///
/// Unknown fields present on read (written by a newer version of the
/// process) are captured in `extra` and re-emitted verbatim on the next
/// write, so a field addition never breaks an older reader and an older
/// reader never discards data it doesn't understand. This is the concrete
/// mechanism behind spec §6's "values... serialized in a self-describing,
/// forward-compatible form".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Versioned<T> {
    #[serde(flatten)]
    pub value: T,
    #[serde(flatten, default)]
    pub extra: Map<String, Value>,
}

impl<T: Serialize + DeserializeOwned> Versioned<T> {
    pub fn new(value: T) -> Self {
        Versioned {
            value,
            extra: Map::new(),
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
