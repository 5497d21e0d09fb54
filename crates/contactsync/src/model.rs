//! Contact and group records shared by both replicas.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Seconds since the Unix epoch.
pub type Timestamp = i64;

/// Well-known contact field names.
pub mod fields {
    pub const DISPLAY_NAME: &str = "displayName";
    pub const GIVEN_NAME: &str = "givenName";
    pub const FAMILY_NAME: &str = "familyName";
    pub const PRIMARY_EMAIL: &str = "primaryEmail";
    pub const SECOND_EMAIL: &str = "secondEmail";
    pub const WORK_PHONE: &str = "workPhone";
    pub const HOME_PHONE: &str = "homePhone";
    pub const MOBILE_PHONE: &str = "mobilePhone";
    pub const ADDRESS: &str = "address";
    pub const ORGANIZATION: &str = "organization";
    pub const JOB_TITLE: &str = "jobTitle";
    pub const NOTES: &str = "notes";
    pub const PHOTO_ETAG: &str = "photoEtag";

    /// At least one of these must be non-empty for the remote schema to accept a contact.
    pub const IDENTIFYING: [&str; 3] = [DISPLAY_NAME, PRIMARY_EMAIL, SECOND_EMAIL];
}

/// Identifier of a record on the remote side, kept in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct RemoteId(String);

impl RemoteId {
    /// Normalize a raw identifier: trimmed, lower-cased, `http://` upgraded to `https://`.
    pub fn new(raw: impl AsRef<str>) -> Self {
        let lowered = raw.as_ref().trim().to_lowercase();
        match lowered.strip_prefix("http://") {
            Some(rest) => Self(format!("https://{rest}")),
            None => Self(lowered),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path component of the identifier with the `base` projection switched to `full`.
    ///
    /// Identifiers that are not URLs are returned unchanged.
    #[must_use]
    pub fn full_projection_path(&self) -> String {
        let path = match url::Url::parse(&self.0) {
            Ok(parsed) => parsed.path().to_string(),
            Err(_) => return self.0.clone(),
        };
        path.replacen("/base/", "/full/", 1)
    }
}

impl From<String> for RemoteId {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<&str> for RemoteId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<RemoteId> for String {
    fn from(id: RemoteId) -> Self {
        id.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A contact as held by either replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRecord {
    /// Handle assigned by the local store; `None` for remote records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    /// Link to the remote replica, once one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<RemoteId>,
    /// Field name to value.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Group identifiers in this replica's own namespace.
    #[serde(default)]
    pub groups: BTreeSet<String>,
    pub last_modified: Timestamp,
}

impl ContactRecord {
    #[must_use]
    pub fn new(last_modified: Timestamp) -> Self {
        Self {
            last_modified,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_field(mut self, name: &str, value: impl Into<String>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn with_remote_id(mut self, id: impl Into<RemoteId>) -> Self {
        self.remote_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_local_id(mut self, id: impl Into<String>) -> Self {
        self.local_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Whether the remote schema can accept this contact.
    pub fn is_representable(&self) -> bool {
        fields::IDENTIFYING.iter().any(|f| self.field(f).is_some())
    }

    /// Human-readable label for logging.
    pub fn label(&self) -> &str {
        self.field(fields::DISPLAY_NAME)
            .or_else(|| self.field(fields::PRIMARY_EMAIL))
            .or(self.local_id.as_deref())
            .or(self.remote_id.as_ref().map(RemoteId::as_str))
            .unwrap_or("<unnamed>")
    }

    /// Field values with empty entries dropped, for content comparison.
    pub fn significant_fields(&self) -> BTreeMap<&str, &str> {
        self.fields
            .iter()
            .filter(|(_, v)| !v.trim().is_empty())
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }
}

/// Built-in groups that exist on every account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemGroup {
    Contacts,
    Friends,
    Family,
    Coworkers,
}

impl SystemGroup {
    /// Identifier used by the remote `systemGroup` element.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemGroup::Contacts => "Contacts",
            SystemGroup::Friends => "Friends",
            SystemGroup::Family => "Family",
            SystemGroup::Coworkers => "Coworkers",
        }
    }

    /// Fixed built-in group number on the remote side.
    #[must_use]
    pub fn builtin_id(&self) -> &'static str {
        match self {
            SystemGroup::Contacts => "6",
            SystemGroup::Friends => "d",
            SystemGroup::Family => "e",
            SystemGroup::Coworkers => "f",
        }
    }
}

impl std::str::FromStr for SystemGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "contacts" => Ok(SystemGroup::Contacts),
            "friends" => Ok(SystemGroup::Friends),
            "family" => Ok(SystemGroup::Family),
            "coworkers" => Ok(SystemGroup::Coworkers),
            _ => Err(format!("Unknown system group: {s}")),
        }
    }
}

/// A named collection of contacts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<RemoteId>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_group: Option<SystemGroup>,
    pub last_modified: Timestamp,
}

impl GroupRecord {
    pub fn new(name: impl Into<String>, last_modified: Timestamp) -> Self {
        Self {
            name: name.into(),
            last_modified,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_remote_id(mut self, id: impl Into<RemoteId>) -> Self {
        self.remote_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_local_id(mut self, id: impl Into<String>) -> Self {
        self.local_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn system(mut self, kind: SystemGroup) -> Self {
        self.system_group = Some(kind);
        self
    }

    pub fn is_system(&self) -> bool {
        self.system_group.is_some()
    }
}
