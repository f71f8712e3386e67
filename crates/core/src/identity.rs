use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Account category assigned at registration. The wire form matches the
/// stored form (`eventuser`, `vendor`, `guest`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    EventUser,
    Vendor,
    Guest,
}

impl UserRole {
    pub const ALL: [UserRole; 3] = [UserRole::EventUser, UserRole::Vendor, UserRole::Guest];

    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::EventUser => "eventuser",
            UserRole::Vendor => "vendor",
            UserRole::Guest => "guest",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown user role: {0}")]
pub struct UnknownRole(String);

impl FromStr for UserRole {
    type Err = UnknownRole;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        UserRole::ALL
            .iter()
            .copied()
            .find(|role| role.as_str() == value)
            .ok_or_else(|| UnknownRole(value.to_owned()))
    }
}

impl TryFrom<String> for UserRole {
    type Error = UnknownRole;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
