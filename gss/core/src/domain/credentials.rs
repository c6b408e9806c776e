// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Identities and connection descriptors used to key and describe contexts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::errors::GssError;

/// Credentials of the user a client context is negotiated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserCred {
    pub uid: u32,
    pub gid: u32,
}

impl UserCred {
    pub const ROOT: UserCred = UserCred { uid: 0, gid: 0 };

    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Role of a node in the cluster, on either end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecPart {
    Cli,
    Mdt,
    Ost,
    Mgc,
    Mgs,
}

impl SecPart {
    /// Role flags passed to the helper for root contexts.
    pub fn upcall_flags(&self) -> Result<&'static str, GssError> {
        match self {
            SecPart::Mdt => Ok("m"),
            SecPart::Ost => Ok("o"),
            SecPart::Mgc => Ok("rmo"),
            SecPart::Cli => Ok("r"),
            SecPart::Mgs => Err(GssError::UnsupportedService(
                "MGS cannot initiate root contexts".to_string(),
            )),
        }
    }

    /// Service class of a target in this role.
    pub fn service(&self) -> GssService {
        match self {
            SecPart::Mgs | SecPart::Mgc => GssService::Mgs,
            SecPart::Ost => GssService::Oss,
            SecPart::Mdt | SecPart::Cli => GssService::Mds,
        }
    }
}

impl fmt::Display for SecPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SecPart::Cli => "cli",
            SecPart::Mdt => "mdt",
            SecPart::Ost => "ost",
            SecPart::Mgc => "mgc",
            SecPart::Mgs => "mgs",
        };
        f.write_str(name)
    }
}

/// Protection level requested for RPCs over a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceLevel {
    Null,
    #[default]
    Auth,
    Integrity,
    Privacy,
}

impl ServiceLevel {
    pub fn flag(&self) -> char {
        match self {
            ServiceLevel::Null => 'n',
            ServiceLevel::Auth => 'a',
            ServiceLevel::Integrity => 'i',
            ServiceLevel::Privacy => 'p',
        }
    }
}

/// Target service class as understood by the helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GssService {
    Mgs = 0,
    Mds = 1,
    Oss = 2,
}

/// Client device types allowed to negotiate contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObdType {
    Mdc,
    Osc,
    Mgc,
    Lwp,
    Osp,
}

impl FromStr for ObdType {
    type Err = GssError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mdc" => Ok(ObdType::Mdc),
            "osc" => Ok(ObdType::Osc),
            "mgc" => Ok(ObdType::Mgc),
            "lwp" => Ok(ObdType::Lwp),
            "osp" => Ok(ObdType::Osp),
            other => Err(GssError::UnsupportedService(format!(
                "device type '{}' cannot use gss",
                other
            ))),
        }
    }
}

/// The connection a client security domain authenticates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportInfo {
    /// Local device name, e.g. `fsX-MDT0000-mdc-ffff8800`.
    pub obd_name: String,
    /// Local device type, e.g. `mdc`.
    pub obd_type: String,
    pub peer_nid: u64,
    pub self_nid: u64,
    /// Process that set up the import; reported for root upcalls.
    pub refpid: u32,
    /// Role of the peer.
    pub target_part: SecPart,
}

impl ImportInfo {
    pub fn obd_type(&self) -> Result<ObdType, GssError> {
        self.obd_type.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upcall_flags_by_role() {
        assert_eq!(SecPart::Mdt.upcall_flags().unwrap(), "m");
        assert_eq!(SecPart::Ost.upcall_flags().unwrap(), "o");
        assert_eq!(SecPart::Mgc.upcall_flags().unwrap(), "rmo");
        assert_eq!(SecPart::Cli.upcall_flags().unwrap(), "r");
        assert!(SecPart::Mgs.upcall_flags().is_err());
    }

    #[test]
    fn test_obd_type_whitelist() {
        for name in ["mdc", "osc", "mgc", "lwp", "osp"] {
            assert!(name.parse::<ObdType>().is_ok(), "{name} should be accepted");
        }
        assert!(matches!(
            "lov".parse::<ObdType>(),
            Err(GssError::UnsupportedService(_))
        ));
    }

    #[test]
    fn test_service_flags() {
        assert_eq!(ServiceLevel::Null.flag(), 'n');
        assert_eq!(ServiceLevel::Privacy.flag(), 'p');
        assert_eq!(SecPart::Ost.service() as u32, 2);
    }
}
