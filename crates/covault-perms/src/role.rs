//! Member roles and how groups hand them down.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A member's role in a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Admin,
    Writer,
    Reader,
    /// May append but not read other members' content.
    WriteOnly,
    Revoked,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Writer => "writer",
            Role::Reader => "reader",
            Role::WriteOnly => "writeOnly",
            Role::Revoked => "revoked",
        }
    }

    fn rank(self) -> u8 {
        match self {
            Role::Admin => 3,
            Role::Writer => 2,
            Role::Reader | Role::WriteOnly => 1,
            Role::Revoked => 0,
        }
    }

    /// Strict ordering admin > writer > reader > revoked.
    ///
    /// `writeOnly` sits next to `reader` and neither is higher than the other.
    pub fn is_higher_than(self, other: Option<Role>) -> bool {
        match other {
            None => self != Role::Revoked,
            Some(other) => self.rank() > other.rank(),
        }
    }

    pub fn can_write(self) -> bool {
        matches!(self, Role::Admin | Role::Writer | Role::WriteOnly)
    }

    pub fn can_read(self) -> bool {
        matches!(self, Role::Admin | Role::Writer | Role::Reader)
    }

    pub fn is_admin(self) -> bool {
        self == Role::Admin
    }

    /// Roles a parent group passes on to its children.
    pub fn is_inheritable(self) -> bool {
        matches!(self, Role::Admin | Role::Writer | Role::Reader)
    }

    /// Roles that may be granted to `everyone`.
    pub fn allowed_for_everyone(self) -> bool {
        matches!(
            self,
            Role::Writer | Role::Reader | Role::WriteOnly | Role::Revoked
        )
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "writer" => Ok(Role::Writer),
            "reader" => Ok(Role::Reader),
            "writeOnly" => Ok(Role::WriteOnly),
            "revoked" => Ok(Role::Revoked),
            other => Err(format!("unknown role {:?}", other)),
        }
    }
}

/// What a child group grants to members of a parent it extends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentRole {
    /// Members keep the role they have in the parent.
    Extend,
    /// Members of the parent get this role, whatever their parent role.
    Role(Role),
}

impl ParentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ParentRole::Extend => "extend",
            ParentRole::Role(role) => role.as_str(),
        }
    }

    /// The role a member with `parent_role` in the parent gets in the child.
    ///
    /// Only members with an inheritable parent role get anything. An explicit
    /// mapping replaces the parent role.
    pub fn inherit(self, parent_role: Option<Role>) -> Option<Role> {
        let parent_role = parent_role.filter(|r| r.is_inheritable())?;
        match self {
            ParentRole::Extend => Some(parent_role),
            ParentRole::Role(Role::Revoked) => None,
            ParentRole::Role(mapped) => Some(mapped),
        }
    }
}

impl FromStr for ParentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "extend" {
            Ok(ParentRole::Extend)
        } else {
            s.parse().map(ParentRole::Role)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(Role::Admin.is_higher_than(Some(Role::Writer)));
        assert!(Role::Writer.is_higher_than(Some(Role::Reader)));
        assert!(Role::Reader.is_higher_than(None));
        assert!(!Role::Reader.is_higher_than(Some(Role::WriteOnly)));
        assert!(!Role::WriteOnly.is_higher_than(Some(Role::Reader)));
        assert!(!Role::Revoked.is_higher_than(None));
    }

    #[test]
    fn test_string_forms() {
        for role in [
            Role::Admin,
            Role::Writer,
            Role::Reader,
            Role::WriteOnly,
            Role::Revoked,
        ] {
            assert_eq!(role.as_str().parse::<Role>(), Ok(role));
            assert_eq!(
                serde_json::to_value(role).unwrap(),
                serde_json::Value::from(role.as_str())
            );
        }
        assert!("owner".parse::<Role>().is_err());
        assert_eq!("extend".parse::<ParentRole>(), Ok(ParentRole::Extend));
    }

    #[test]
    fn test_inherit() {
        assert_eq!(ParentRole::Extend.inherit(Some(Role::Admin)), Some(Role::Admin));
        assert_eq!(ParentRole::Extend.inherit(Some(Role::WriteOnly)), None);
        assert_eq!(ParentRole::Extend.inherit(None), None);
        assert_eq!(
            ParentRole::Role(Role::Reader).inherit(Some(Role::Admin)),
            Some(Role::Reader)
        );
        assert_eq!(
            ParentRole::Role(Role::Writer).inherit(Some(Role::Reader)),
            Some(Role::Writer)
        );
        assert_eq!(ParentRole::Role(Role::Writer).inherit(Some(Role::WriteOnly)), None);
        assert_eq!(ParentRole::Role(Role::Writer).inherit(None), None);
        assert_eq!(ParentRole::Role(Role::Revoked).inherit(Some(Role::Admin)), None);
    }
}
