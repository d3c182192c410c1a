//! Permission catalogue, system roles and the checks evaluated against them.

use std::collections::{BTreeMap, BTreeSet};

use crate::db::{Permissions, Role, User};

pub const WILDCARD: &str = "*";

/// Actions a role may grant on a resource.
pub const ACTIONS: [&str; 5] = ["create", "read", "update", "delete", WILDCARD];

/// Resources that permissions can be attached to, with a short description.
pub const RESOURCES: [(&str, &str); 7] = [
    ("vms", "Virtual machines"),
    ("hypervisors", "Source hypervisors"),
    ("migrations", "Migration operations"),
    ("reports", "Reports and logs"),
    ("users", "User management"),
    ("roles", "Role management"),
    ("settings", "System settings"),
];

pub const SUPER_ADMIN: &str = "super_admin";
pub const ADMIN: &str = "admin";
pub const USER: &str = "user";
pub const VIEWER: &str = "viewer";

pub const SYSTEM_ROLES: [&str; 4] = [SUPER_ADMIN, ADMIN, USER, VIEWER];

pub fn is_valid_action(action: &str) -> bool {
    ACTIONS.contains(&action)
}

/// Builds a permission map from `(resource, "space separated actions")` pairs.
fn grant(entries: &[(&str, &str)]) -> Permissions {
    entries
        .iter()
        .map(|(resource, actions)| {
            (
                resource.to_string(),
                actions.split_whitespace().map(str::to_string).collect(),
            )
        })
        .collect()
}

/// Permissions of a predefined role, or `None` for any other name.
pub fn system_role_permissions(name: &str) -> Option<Permissions> {
    let permissions = match name {
        SUPER_ADMIN => grant(
            &RESOURCES
                .iter()
                .map(|(resource, _)| (*resource, WILDCARD))
                .collect::<Vec<_>>(),
        ),
        ADMIN => grant(&[
            ("users", "read create update"),
            ("hypervisors", WILDCARD),
            ("vms", WILDCARD),
            ("migrations", WILDCARD),
            ("reports", WILDCARD),
        ]),
        USER => grant(&[
            ("vms", "read create update"),
            ("migrations", "read create"),
            ("reports", "read"),
        ]),
        VIEWER => grant(&[("vms", "read"), ("migrations", "read"), ("reports", "read")]),
        _ => return None,
    };
    Some(permissions)
}

/// "System role: Super Admin" for `super_admin`.
pub fn system_role_description(name: &str) -> String {
    let title = name
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    format!("System role: {title}")
}

impl Role {
    pub fn has_permission(&self, resource: &str, action: &str) -> bool {
        self.permissions.get(resource).is_some_and(|actions| {
            actions
                .iter()
                .any(|granted| granted == action || granted == WILDCARD)
        })
    }
}

impl User {
    pub fn has_role(&self, name: &str) -> bool {
        self.roles.iter().any(|role| role.name == name)
    }

    /// Superusers pass every check; inactive roles grant nothing.
    pub fn has_permission(&self, resource: &str, action: &str) -> bool {
        self.is_superuser
            || self
                .roles
                .iter()
                .any(|role| role.is_active && role.has_permission(resource, action))
    }

    pub fn all_permissions(&self) -> Permissions {
        if self.is_superuser {
            return BTreeMap::from([(WILDCARD.to_string(), vec![WILDCARD.to_string()])]);
        }

        let mut merged: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for role in self.roles.iter().filter(|role| role.is_active) {
            for (resource, actions) in &role.permissions {
                merged
                    .entry(resource.clone())
                    .or_default()
                    .extend(actions.iter().cloned());
            }
        }

        merged
            .into_iter()
            .map(|(resource, actions)| (resource, actions.into_iter().collect()))
            .collect()
    }

    pub fn can_access_tenant(&self, tenant_id: &str) -> bool {
        self.is_superuser || self.tenant_id == tenant_id
    }
}
