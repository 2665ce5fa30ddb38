use nanoid::nanoid;
use serde::{Deserialize, Serialize};

/// Generate a 12-character nanoid for gateway-assigned IDs
pub fn generate_id() -> String {
    nanoid!(12)
}

/// String newtype with the usual conversions. The `generated` form also
/// gets `new()` backed by [`generate_id`].
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            #[must_use]
            pub const fn from_string(id: String) -> Self {
                Self(id)
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
    (generated $(#[$meta:meta])* $name:ident) => {
        string_id!($(#[$meta])* $name);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(generate_id())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

string_id!(
    /// Device identity as reported by the device in its handshake path
    DeviceId
);

string_id!(
    /// Hardware serial number of a device
    DeviceSn
);

string_id!(RoomId);

string_id!(generated
    /// Gateway-internal identity of one WebSocket session
    ConnectionId
);

string_id!(generated
    /// Correlation token pairing a control command with its acknowledgement
    PlayId
);
