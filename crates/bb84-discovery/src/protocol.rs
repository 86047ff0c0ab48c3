//! Announcement wire format.

use crate::error::DiscoveryError;
use serde::{Deserialize, Serialize};

/// Announcement format version; peers speaking another version are ignored
pub const PROTOCOL_VERSION: u32 = 0x0000_0001;

/// Largest announcement datagram accepted or sent
pub const MAX_ANNOUNCEMENT_SIZE: usize = 512;

/// Longest display name carried in an announcement
pub const MAX_NAME_LEN: usize = 255;

/// Announcement broadcast on the discovery port
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Announcement {
    /// Periodic presence announcement
    Hello {
        /// Random identifier of the announcing process, stable for its lifetime
        instance: u64,
        /// Display name
        name: String,
        /// TCP port the node accepts exchanges on
        port: u16,
        /// Protocol version of the sender
        version: u32,
    },

    /// The sender is shutting down
    Goodbye {
        /// Identifier from the sender's `Hello`
        instance: u64,
    },
}

impl Announcement {
    /// Serialize announcement to bytes
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::TooLarge`] if the encoded form exceeds
    /// [`MAX_ANNOUNCEMENT_SIZE`].
    pub fn to_bytes(&self) -> Result<Vec<u8>, DiscoveryError> {
        let bytes =
            bincode::serialize(self).map_err(|e| DiscoveryError::Serialization(e.to_string()))?;
        if bytes.len() > MAX_ANNOUNCEMENT_SIZE {
            return Err(DiscoveryError::TooLarge {
                size: bytes.len(),
                max: MAX_ANNOUNCEMENT_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Deserialize announcement from bytes
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Deserialization`] for anything that is not
    /// a well-formed announcement.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DiscoveryError> {
        if bytes.len() > MAX_ANNOUNCEMENT_SIZE {
            return Err(DiscoveryError::TooLarge {
                size: bytes.len(),
                max: MAX_ANNOUNCEMENT_SIZE,
            });
        }
        let announcement: Self = bincode::deserialize(bytes)
            .map_err(|e| DiscoveryError::Deserialization(e.to_string()))?;
        if let Announcement::Hello { name, .. } = &announcement {
            if name.is_empty() || name.len() > MAX_NAME_LEN {
                return Err(DiscoveryError::Deserialization(format!(
                    "invalid name length {}",
                    name.len()
                )));
            }
        }
        Ok(announcement)
    }

    /// Instance identifier of the sender
    #[must_use]
    pub fn instance(&self) -> u64 {
        match self {
            Announcement::Hello { instance, .. } | Announcement::Goodbye { instance } => *instance,
        }
    }

    /// Get the message type name
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Announcement::Hello { .. } => "Hello",
            Announcement::Goodbye { .. } => "Goodbye",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_decodes() {
        let hello = Announcement::Hello {
            instance: 42,
            name: "alice".into(),
            port: 7000,
            version: 1,
        };
        let bytes = hello.to_bytes().unwrap();
        assert_eq!(Announcement::from_bytes(&bytes).unwrap(), hello);
        assert_eq!(hello.instance(), 42);
        assert_eq!(hello.message_type(), "Hello");
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(Announcement::from_bytes(&[0xff; 3]).is_err());
        assert!(Announcement::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_oversized_rejected() {
        let bytes = vec![0u8; MAX_ANNOUNCEMENT_SIZE + 1];
        assert!(matches!(
            Announcement::from_bytes(&bytes),
            Err(DiscoveryError::TooLarge { .. })
        ));

        let hello = Announcement::Hello {
            instance: 1,
            name: "x".repeat(MAX_ANNOUNCEMENT_SIZE),
            port: 1,
            version: 1,
        };
        assert!(hello.to_bytes().is_err());
    }

    #[test]
    fn test_empty_name_rejected() {
        let hello = Announcement::Hello {
            instance: 1,
            name: String::new(),
            port: 1,
            version: 1,
        };
        let bytes = hello.to_bytes().unwrap();
        assert!(Announcement::from_bytes(&bytes).is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn hello_survives_encoding(
                instance in any::<u64>(),
                name in "[a-zA-Z0-9 _-]{1,255}",
                port in any::<u16>(),
                version in any::<u32>(),
            ) {
                let hello = Announcement::Hello { instance, name, port, version };
                let bytes = hello.to_bytes().unwrap();
                prop_assert!(bytes.len() <= MAX_ANNOUNCEMENT_SIZE);
                prop_assert_eq!(Announcement::from_bytes(&bytes).unwrap(), hello);
            }

            #[test]
            fn overlong_names_rejected(extra in 1usize..200) {
                let hello = Announcement::Hello {
                    instance: 1,
                    name: "n".repeat(MAX_NAME_LEN + extra),
                    port: 1,
                    version: PROTOCOL_VERSION,
                };
                // Either too large to encode or refused on decode
                if let Ok(bytes) = hello.to_bytes() {
                    prop_assert!(Announcement::from_bytes(&bytes).is_err());
                }
            }

            #[test]
            fn goodbye_survives_encoding(instance in any::<u64>()) {
                let goodbye = Announcement::Goodbye { instance };
                let bytes = goodbye.to_bytes().unwrap();
                prop_assert_eq!(Announcement::from_bytes(&bytes).unwrap(), goodbye);
            }
        }
    }
}
