//! Enumerated attribute types published by the devices.
//!
//! Every enum is stored in the configuration database by its canonical
//! upper-case name. Decoding is total: an unrecognised name yields `None`
//! instead of an error, so a corrupted entry degrades to an unknown value.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Error returned by `FromStr` for an unrecognised name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownName {
    pub kind: &'static str,
    pub value: String,
}

/// Declare an enum together with its name codec.
macro_rules! named_enum {
    (
        $(#[$meta:meta])*
        $name:ident : $kind:literal { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownName;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_name(s).ok_or_else(|| UnknownName {
                    kind: $kind,
                    value: s.to_string(),
                })
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

named_enum! {
    /// Device state.
    DevState: "device state" {
        On => "ON",
        Off => "OFF",
        Close => "CLOSE",
        Open => "OPEN",
        Insert => "INSERT",
        Extract => "EXTRACT",
        Moving => "MOVING",
        Standby => "STANDBY",
        Fault => "FAULT",
        Init => "INIT",
        Running => "RUNNING",
        Alarm => "ALARM",
        Disable => "DISABLE",
        Unknown => "UNKNOWN",
    }
}

named_enum! {
    /// Observing state of a subarray.
    ObsState: "obsState" {
        Empty => "EMPTY",
        Resourcing => "RESOURCING",
        Idle => "IDLE",
        Configuring => "CONFIGURING",
        Ready => "READY",
        Scanning => "SCANNING",
        Aborting => "ABORTING",
        Aborted => "ABORTED",
        Resetting => "RESETTING",
        Fault => "FAULT",
        Restarting => "RESTARTING",
    }
}

named_enum! {
    AdminMode: "adminMode" {
        Online => "ONLINE",
        Offline => "OFFLINE",
        Maintenance => "MAINTENANCE",
        NotFitted => "NOT_FITTED",
        Reserved => "RESERVED",
    }
}

named_enum! {
    HealthState: "healthState" {
        Ok => "OK",
        Degraded => "DEGRADED",
        Failed => "FAILED",
        Unknown => "UNKNOWN",
    }
}

/// A published attribute value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    State(Option<DevState>),
    ObsState(Option<ObsState>),
    AdminMode(Option<AdminMode>),
    HealthState(Option<HealthState>),
    Text(String),
    Int(i64),
}

impl From<Option<DevState>> for AttributeValue {
    fn from(v: Option<DevState>) -> Self {
        AttributeValue::State(v)
    }
}

impl From<Option<ObsState>> for AttributeValue {
    fn from(v: Option<ObsState>) -> Self {
        AttributeValue::ObsState(v)
    }
}

impl From<Option<AdminMode>> for AttributeValue {
    fn from(v: Option<AdminMode>) -> Self {
        AttributeValue::AdminMode(v)
    }
}

impl From<Option<HealthState>> for AttributeValue {
    fn from(v: Option<HealthState>) -> Self {
        AttributeValue::HealthState(v)
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Text(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn opt<T: fmt::Display>(f: &mut fmt::Formatter<'_>, v: &Option<T>) -> fmt::Result {
            match v {
                Some(v) => write!(f, "{v}"),
                None => f.write_str("None"),
            }
        }
        match self {
            AttributeValue::State(v) => opt(f, v),
            AttributeValue::ObsState(v) => opt(f, v),
            AttributeValue::AdminMode(v) => opt(f, v),
            AttributeValue::HealthState(v) => opt(f, v),
            AttributeValue::Text(v) => f.write_str(v),
            AttributeValue::Int(v) => write!(f, "{v}"),
        }
    }
}
