use std::fmt;

use derive_new::new;
use getset::{CopyGetters, Getters};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const LOOPBACK: &str = "127.0.0.1";

static ADDRESS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([^:\s]+):([^:\s]+)$").unwrap());
static IPV4: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})$").unwrap());
static DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").unwrap());

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Role {
    /// Knows the responder's address and sends the offer.
    #[serde(rename = "sender")]
    Initiator,
    /// Waits in its room for an offer.
    #[serde(rename = "receiver")]
    Responder,
}

impl Role {
    pub fn toggled(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }

    /// Name used on the relay and in user-facing text.
    pub fn mode_name(self) -> &'static str {
        match self {
            Self::Initiator => "sender",
            Self::Responder => "receiver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mode_name())
    }
}

#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RoomKey(String);

impl RoomKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn generate() -> Self {
        Self(format!("receiver_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidationErrorKind {
    MissingField,
    MalformedAddress,
    OutOfRangeField,
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ValidationError {
    #[error("please enter your {0}")]
    MissingField(&'static str),
    #[error("invalid address format, use IP:PORT (e.g. 127.0.0.1:8080): {0}")]
    MalformedAddress(String),
    #[error("invalid IP address or port: {0}")]
    OutOfRangeField(String),
}

impl ValidationError {
    pub fn kind(&self) -> ValidationErrorKind {
        match self {
            Self::MissingField(_) => ValidationErrorKind::MissingField,
            Self::MalformedAddress(_) => ValidationErrorKind::MalformedAddress,
            Self::OutOfRangeField(_) => ValidationErrorKind::OutOfRangeField,
        }
    }
}

#[derive(Clone, CopyGetters, Debug, Eq, Getters, PartialEq, new)]
pub struct Resolution {
    #[get = "pub"]
    room_key: RoomKey,
    #[get_copy = "pub"]
    role: Role,
}

impl Resolution {
    pub fn into_room_key(self) -> RoomKey {
        self.room_key
    }
}

/// Parses `IP:PORT` (or `localhost:PORT`) and returns its canonical form.
pub fn normalize_address(raw: &str) -> Result<String, ValidationError> {
    let raw = raw.trim();
    let captures = ADDRESS
        .captures(raw)
        .ok_or_else(|| ValidationError::MalformedAddress(raw.to_owned()))?;
    let host = &captures[1];
    let port = &captures[2];

    let host = if host.eq_ignore_ascii_case("localhost") {
        LOOPBACK.to_owned()
    } else {
        let octets = IPV4
            .captures(host)
            .ok_or_else(|| ValidationError::MalformedAddress(raw.to_owned()))?;
        let mut normalized = Vec::with_capacity(4);
        for idx in 1..=4 {
            let octet: u16 = octets[idx]
                .parse()
                .map_err(|_| ValidationError::MalformedAddress(raw.to_owned()))?;
            if octet > 255 {
                return Err(ValidationError::OutOfRangeField(raw.to_owned()));
            }
            normalized.push(octet.to_string());
        }
        normalized.join(".")
    };

    if !DIGITS.is_match(port) {
        return Err(ValidationError::MalformedAddress(raw.to_owned()));
    }
    // NOTE: over-long digit strings overflow u64 parsing, which is still out of range.
    let port = port.parse::<u64>().unwrap_or(u64::MAX);
    if port == 0 || port > u16::MAX as u64 {
        return Err(ValidationError::OutOfRangeField(raw.to_owned()));
    }

    Ok(format!("{}:{}", host, port))
}

/// Computes the room both endpoints meet in.
///
/// Initiators must name the responder's address, which becomes the room key verbatim (after
/// normalization). Responders may leave it empty, in which case a unique key is generated;
/// anything that looks like an address is validated the same way as on the initiator side,
/// otherwise it is used as an opaque key.
pub fn resolve(raw_input: &str, declared_role: Role) -> Result<Resolution, ValidationError> {
    let input = raw_input.trim();
    let room_key = match declared_role {
        Role::Initiator => {
            if input.is_empty() {
                return Err(ValidationError::MissingField("target address"));
            }
            RoomKey::new(normalize_address(input)?)
        }
        Role::Responder => {
            if input.is_empty() {
                RoomKey::generate()
            } else if input.contains(':') {
                RoomKey::new(normalize_address(input)?)
            } else {
                RoomKey::new(input)
            }
        }
    };
    Ok(Resolution::new(room_key, declared_role))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiator_room_is_normalized_address() {
        let resolution = resolve("127.0.0.1:8080", Role::Initiator).unwrap();
        assert_eq!(resolution.room_key().as_str(), "127.0.0.1:8080");
        assert_eq!(resolution.role(), Role::Initiator);

        let resolution = resolve("  192.168.001.10:0080 ", Role::Initiator).unwrap();
        assert_eq!(resolution.room_key().as_str(), "192.168.1.10:80");
    }

    #[test]
    fn localhost_and_loopback_are_the_same_room() {
        let a = resolve("localhost:8080", Role::Initiator).unwrap();
        let b = resolve("127.0.0.1:8080", Role::Initiator).unwrap();
        assert_eq!(a.room_key(), b.room_key());
        let c = resolve("LocalHost:8080", Role::Responder).unwrap();
        assert_eq!(a.room_key(), c.room_key());
    }

    #[test]
    fn resolution_is_stable() {
        for input in ["10.0.0.1:1", "255.255.255.255:65535", "0.0.0.0:443"] {
            let first = resolve(input, Role::Initiator).unwrap();
            let second = resolve(first.room_key().as_str(), Role::Initiator).unwrap();
            assert_eq!(first, second);
            assert_eq!(first.room_key().as_str(), input);
        }
    }

    #[test]
    fn malformed_inputs() {
        for input in [
            "127.0.0.1",
            "127.0.0.1:",
            ":8080",
            "127.0.0.1:80:80",
            "example.com:80",
            "1.2.3:80",
            "1.2.3.4.5:80",
            "1.2.3.4:http",
            "1.2.3.4:-1",
            "1. 2.3.4:80",
        ] {
            let err = resolve(input, Role::Initiator).unwrap_err();
            assert_eq!(err.kind(), ValidationErrorKind::MalformedAddress, "{}", input);
        }
    }

    #[test]
    fn out_of_range_inputs() {
        for input in [
            "999.1.1.1:70000",
            "256.0.0.1:80",
            "1.2.3.4:0",
            "1.2.3.4:65536",
            "1.2.3.4:99999999999999999999999",
        ] {
            let err = resolve(input, Role::Initiator).unwrap_err();
            assert_eq!(err.kind(), ValidationErrorKind::OutOfRangeField, "{}", input);
        }
    }

    #[test]
    fn initiator_requires_address() {
        let err = resolve("   ", Role::Initiator).unwrap_err();
        assert_eq!(err, ValidationError::MissingField("target address"));
    }

    #[test]
    fn responder_rooms() {
        let generated = resolve("", Role::Responder).unwrap();
        assert!(generated.room_key().as_str().starts_with("receiver_"));
        let other = resolve("", Role::Responder).unwrap();
        assert_ne!(generated.room_key(), other.room_key());

        let supplied = resolve("localhost:9000", Role::Responder).unwrap();
        assert_eq!(supplied.room_key().as_str(), "127.0.0.1:9000");

        let opaque = resolve("team-room", Role::Responder).unwrap();
        assert_eq!(opaque.room_key().as_str(), "team-room");

        let err = resolve("999.1.1.1:70000", Role::Responder).unwrap_err();
        assert_eq!(err.kind(), ValidationErrorKind::OutOfRangeField);
    }

    #[test]
    fn role_wire_names() {
        assert_eq!(serde_json::to_string(&Role::Initiator).unwrap(), "\"sender\"");
        assert_eq!(
            serde_json::from_str::<Role>("\"receiver\"").unwrap(),
            Role::Responder
        );
        assert_eq!(Role::Initiator.toggled(), Role::Responder);
    }
}
