//! Participant identities and session suffixes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::IpcError;

/// Suffix appended to the mutex region name of a mailbox.
pub const MUTEX_SUFFIX: &str = "_mutex_lock";

/// Name of one IPC participant.
///
/// The name is used verbatim as the mailbox region name, so it obeys the
/// region naming rules (non-empty, no `/`, no NUL) and leaves room for the
/// mutex suffix. Two identities are equal iff their names are byte-equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Validate and wrap a name.
    pub fn new(name: impl Into<String>) -> Result<Self, IpcError> {
        let name = name.into();
        let max = postbox_shm::MAX_NAME_LEN - MUTEX_SUFFIX.len();
        if name.trim().is_empty() {
            return Err(IpcError::InvalidArgument("identity name is empty".into()));
        }
        if name.len() > max {
            return Err(IpcError::InvalidArgument(format!(
                "identity name longer than {} bytes: {}",
                max, name
            )));
        }
        postbox_shm::validate_name(&name)
            .map_err(|_| IpcError::InvalidArgument(format!("invalid identity name: {:?}", name)))?;
        Ok(Self(name))
    }

    /// Append `_<suffix>` unless the name already ends with it.
    pub fn with_suffix(&self, suffix: Option<&str>) -> Result<Self, IpcError> {
        match suffix {
            Some(suffix) if !suffix.is_empty() => {
                let tail = format!("_{}", suffix);
                if self.0.ends_with(&tail) {
                    Ok(self.clone())
                } else {
                    Self::new(format!("{}{}", self.0, tail))
                }
            }
            _ => Ok(self.clone()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the mailbox region.
    pub fn mailbox_name(&self) -> &str {
        &self.0
    }

    /// Name of the mailbox mutex region.
    pub fn mutex_name(&self) -> String {
        format!("{}{}", self.0, MUTEX_SUFFIX)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Identity {
    type Error = IpcError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> String {
        identity.0
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Provides the discriminator that keeps identities of concurrent login
/// sessions on one host apart.
///
/// Queried once, when a controller is initialized.
pub trait SessionSuffix: Send + Sync {
    fn suffix(&self) -> Option<String>;
}

/// No suffix: names are used as given.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSuffix;

impl SessionSuffix for NoSuffix {
    fn suffix(&self) -> Option<String> {
        None
    }
}

/// A fixed suffix.
#[derive(Debug, Clone)]
pub struct FixedSuffix(pub String);

impl SessionSuffix for FixedSuffix {
    fn suffix(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// The current login session.
///
/// Uses the audit session id from `/proc/self/sessionid` and falls back to the
/// process session id when auditing is unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoginSession;

/// Value of `/proc/self/sessionid` when no audit session is set.
const UNSET_AUDIT_SESSION: &str = "4294967295";

impl SessionSuffix for LoginSession {
    fn suffix(&self) -> Option<String> {
        if let Ok(raw) = std::fs::read_to_string("/proc/self/sessionid") {
            let id = raw.trim();
            if !id.is_empty() && id != UNSET_AUDIT_SESSION {
                return Some(id.to_string());
            }
        }

        // SAFETY: getsid(0) only queries the calling process.
        let sid = unsafe { libc::getsid(0) };
        (sid >= 0).then(|| sid.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unusable_names() {
        assert!(Identity::new("").is_err());
        assert!(Identity::new("   ").is_err());
        assert!(Identity::new("a/b").is_err());
        assert!(Identity::new("x".repeat(250)).is_err());
        assert!(Identity::new("svcA").is_ok());
    }

    #[test]
    fn names_are_case_sensitive() {
        assert_ne!(Identity::new("svcA").unwrap(), Identity::new("svca").unwrap());
    }

    #[test]
    fn suffix_is_applied_once() {
        let id = Identity::new("svcA").unwrap();
        let suffixed = id.with_suffix(Some("42")).unwrap();
        assert_eq!(suffixed.as_str(), "svcA_42");
        assert_eq!(suffixed.with_suffix(Some("42")).unwrap(), suffixed);
        assert_eq!(id.with_suffix(None).unwrap(), id);
    }

    #[test]
    fn mutex_name_follows_mailbox_name() {
        let id = Identity::new("svcB").unwrap();
        assert_eq!(id.mailbox_name(), "svcB");
        assert_eq!(id.mutex_name(), "svcB_mutex_lock");
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = Identity::new("svcA").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"svcA\"");
        let back: Identity = serde_json::from_str("\"svcA\"").unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<Identity>("\"a/b\"").is_err());
    }

    #[test]
    fn login_session_yields_some_suffix() {
        assert!(LoginSession.suffix().is_some());
    }
}
