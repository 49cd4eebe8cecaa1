//! Graph payloads and the file results handed to the rest of docseek.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One page of a Graph collection.
#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Page<T> {
    #[serde(default)]
    pub value: Vec<T>,
    #[serde(rename = "@odata.nextLink", default)]
    pub next_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Site {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Drive {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drive_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub web_url: Option<String>,
    #[serde(default)]
    pub parent_reference: Option<ParentReference>,
}

/// Which drive a result came from: the user's own, or a site's.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ScopeTag {
    Personal,
    Site(String),
}

impl ScopeTag {
    pub fn site_id(&self) -> Option<&str> {
        match self {
            ScopeTag::Personal => None,
            ScopeTag::Site(id) => Some(id),
        }
    }
}

impl From<String> for ScopeTag {
    fn from(value: String) -> Self {
        if value == "personal" {
            ScopeTag::Personal
        } else {
            ScopeTag::Site(value)
        }
    }
}

impl From<ScopeTag> for String {
    fn from(value: ScopeTag) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ScopeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeTag::Personal => f.write_str("personal"),
            ScopeTag::Site(id) => f.write_str(id),
        }
    }
}

/// A discovered file, tagged with the scope it was found in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResult {
    pub id: String,
    pub name: String,
    pub web_url: String,
    pub scope: ScopeTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_reference: Option<ParentReference>,
}

impl FileResult {
    pub fn from_item(item: DriveItem, scope: ScopeTag) -> Self {
        Self {
            id: item.id,
            name: item.name,
            web_url: item.web_url.unwrap_or_default(),
            scope,
            parent_reference: item.parent_reference,
        }
    }

    /// Text the relevance ranker compares against the query.
    pub fn ranking_text(&self) -> String {
        match self.parent_reference.as_ref().and_then(|p| p.path.as_deref()) {
            Some(path) => format!("{} {}", self.name, path),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentitySet {
    #[serde(default)]
    pub user: Option<Identity>,
}

impl IdentitySet {
    fn email(&self) -> Option<&str> {
        self.user
            .as_ref()
            .and_then(|u| u.email.as_deref())
            .filter(|e| !e.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub granted_to: Option<IdentitySet>,
    #[serde(rename = "grantedToV2", default)]
    pub granted_to_v2: Option<IdentitySet>,
    #[serde(rename = "grantedToIdentitiesV2", default)]
    pub granted_to_identities_v2: Vec<IdentitySet>,
}

/// The shapes a permission entry may name its grantee in.
#[derive(Debug, Clone, Copy)]
pub enum Grantee<'a> {
    Direct(&'a IdentitySet),
    V2(&'a IdentitySet),
    FirstIdentity(&'a IdentitySet),
}

impl<'a> Grantee<'a> {
    pub fn email(&self) -> Option<&'a str> {
        match self {
            Grantee::Direct(set) | Grantee::V2(set) | Grantee::FirstIdentity(set) => set.email(),
        }
    }
}

/// A permission entry reduced to who it applies to and what it allows.
/// `email == None` means the grant is not tied to a particular user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalGrant {
    pub email: Option<String>,
    pub roles: Vec<String>,
}

const READABLE_ROLES: [&str; 3] = ["read", "view", "write"];

impl CanonicalGrant {
    pub fn allows_read(&self) -> bool {
        self.roles
            .iter()
            .any(|r| READABLE_ROLES.iter().any(|allowed| r.eq_ignore_ascii_case(allowed)))
    }

    pub fn applies_to(&self, user_email: &str) -> bool {
        match &self.email {
            Some(email) => email.eq_ignore_ascii_case(user_email),
            None => true,
        }
    }
}

impl Permission {
    pub fn grantees(&self) -> Vec<Grantee<'_>> {
        let mut out = Vec::with_capacity(3);
        if let Some(set) = &self.granted_to {
            out.push(Grantee::Direct(set));
        }
        if let Some(set) = &self.granted_to_v2 {
            out.push(Grantee::V2(set));
        }
        if let Some(set) = self.granted_to_identities_v2.first() {
            out.push(Grantee::FirstIdentity(set));
        }
        out
    }

    /// First resolvable grantee email, in direct, v2, identities order.
    pub fn canonical(&self) -> CanonicalGrant {
        CanonicalGrant {
            email: self
                .grantees()
                .iter()
                .find_map(|g| g.email())
                .map(str::to_string),
            roles: self.roles.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphUser {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub mail: Option<String>,
    #[serde(default)]
    pub user_principal_name: Option<String>,
}

impl GraphUser {
    pub fn email(&self) -> Option<&str> {
        self.mail
            .as_deref()
            .filter(|m| !m.is_empty())
            .or(self.user_principal_name.as_deref())
    }
}
