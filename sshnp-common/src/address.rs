use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque principal identifier on the identity substrate, e.g. `@alice`
/// (spec.md §3). Used both as a routing label and as a key into the
/// substrate's public-key directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

#[derive(Debug, thiserror::Error)]
pub enum AddressParseError {
    #[error("address must start with '@'")]
    MissingSigil,
    #[error("address must not be empty after the '@' sigil")]
    Empty,
}

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.starts_with('@') {
            return Err(AddressParseError::MissingSigil);
        }
        if s.len() == 1 {
            return Err(AddressParseError::Empty);
        }
        Ok(Self(s.to_owned()))
    }
}

impl TryFrom<String> for Address {
    type Error = AddressParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// ASCII device label, `[A-Za-z0-9_]{1,15}` (spec.md §3), chosen at daemon
/// startup and used as the `<device>.sshnp` namespace suffix.
///
/// The only way to obtain one is [`DeviceName::new`], so every consumer that
/// holds a `DeviceName` holds an already-validated one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceName(String);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DeviceNameError {
    #[error("device name must not be empty")]
    Empty,
    #[error("device name must be at most 15 characters, got {0}")]
    TooLong(usize),
    #[error("device name must only contain ASCII letters, digits or underscore")]
    InvalidCharacters,
}

impl DeviceName {
    pub fn new(name: impl Into<String>) -> Result<Self, DeviceNameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(DeviceNameError::Empty);
        }
        if name.len() > 15 {
            return Err(DeviceNameError::TooLong(name.len()));
        }
        if !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Err(DeviceNameError::InvalidCharacters);
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeviceName {
    type Err = DeviceNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for DeviceName {
    type Error = DeviceNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DeviceName> for String {
    fn from(value: DeviceName) -> Self {
        value.0
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_address() {
        assert_eq!(Address::from_str("@alice").unwrap().as_str(), "@alice");
    }

    #[test]
    fn rejects_address_without_sigil() {
        assert!(matches!(
            Address::from_str("alice"),
            Err(AddressParseError::MissingSigil)
        ));
    }

    #[test]
    fn rejects_bare_sigil() {
        assert!(matches!(
            Address::from_str("@"),
            Err(AddressParseError::Empty)
        ));
    }

    #[test]
    fn device_name_rejects_empty() {
        assert_eq!(DeviceName::new(""), Err(DeviceNameError::Empty));
    }

    #[test]
    fn device_name_rejects_length_16() {
        let name = "a".repeat(16);
        assert_eq!(
            DeviceName::new(name.clone()),
            Err(DeviceNameError::TooLong(16))
        );
    }

    #[test]
    fn device_name_accepts_length_15() {
        let name = "a".repeat(15);
        assert!(DeviceName::new(name).is_ok());
    }

    #[test]
    fn device_name_rejects_non_ascii() {
        assert_eq!(
            DeviceName::new("café"),
            Err(DeviceNameError::InvalidCharacters)
        );
    }

    #[test]
    fn device_name_allows_underscore() {
        assert!(DeviceName::new("office_pi").is_ok());
    }
}
