//! Roles and the static role → permission table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Staff role. Each role holds every permission of the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Staff,
    Manager,
    Admin,
}

/// A single grant carried in access tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "customers:read")]
    CustomersRead,
    #[serde(rename = "customers:write")]
    CustomersWrite,
    #[serde(rename = "orders:read")]
    OrdersRead,
    #[serde(rename = "orders:create")]
    OrdersCreate,
    #[serde(rename = "inventory:read")]
    InventoryRead,
    #[serde(rename = "prescriptions:read")]
    PrescriptionsRead,
    #[serde(rename = "orders:update")]
    OrdersUpdate,
    #[serde(rename = "orders:cancel")]
    OrdersCancel,
    #[serde(rename = "inventory:write")]
    InventoryWrite,
    #[serde(rename = "reports:view")]
    ReportsView,
    #[serde(rename = "staff:view")]
    StaffView,
    #[serde(rename = "users:manage")]
    UsersManage,
    #[serde(rename = "stores:manage")]
    StoresManage,
    #[serde(rename = "settings:manage")]
    SettingsManage,
    #[serde(rename = "records:delete")]
    RecordsDelete,
}

const STAFF: &[Permission] = &[
    Permission::CustomersRead,
    Permission::CustomersWrite,
    Permission::OrdersRead,
    Permission::OrdersCreate,
    Permission::InventoryRead,
    Permission::PrescriptionsRead,
];

const MANAGER: &[Permission] = &[
    Permission::CustomersRead,
    Permission::CustomersWrite,
    Permission::OrdersRead,
    Permission::OrdersCreate,
    Permission::InventoryRead,
    Permission::PrescriptionsRead,
    Permission::OrdersUpdate,
    Permission::OrdersCancel,
    Permission::InventoryWrite,
    Permission::ReportsView,
    Permission::StaffView,
];

const ADMIN: &[Permission] = &[
    Permission::CustomersRead,
    Permission::CustomersWrite,
    Permission::OrdersRead,
    Permission::OrdersCreate,
    Permission::InventoryRead,
    Permission::PrescriptionsRead,
    Permission::OrdersUpdate,
    Permission::OrdersCancel,
    Permission::InventoryWrite,
    Permission::ReportsView,
    Permission::StaffView,
    Permission::UsersManage,
    Permission::StoresManage,
    Permission::SettingsManage,
    Permission::RecordsDelete,
];

impl Role {
    /// Permissions granted to this role.
    pub fn permissions(self) -> &'static [Permission] {
        match self {
            Role::Staff => STAFF,
            Role::Manager => MANAGER,
            Role::Admin => ADMIN,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Staff => "staff",
            Role::Manager => "manager",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown role name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "staff" => Ok(Role::Staff),
            "manager" => Ok(Role::Manager),
            "admin" => Ok(Role::Admin),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_strict_superset(big: &[Permission], small: &[Permission]) -> bool {
        small.iter().all(|p| big.contains(p)) && big.len() > small.len()
    }

    #[test]
    fn each_role_strictly_extends_the_previous() {
        assert!(is_strict_superset(
            Role::Manager.permissions(),
            Role::Staff.permissions()
        ));
        assert!(is_strict_superset(
            Role::Admin.permissions(),
            Role::Manager.permissions()
        ));
    }

    #[test]
    fn roles_parse_from_database_text() {
        for role in [Role::Staff, Role::Manager, Role::Admin] {
            assert_eq!(role.as_str().parse::<Role>(), Ok(role));
        }
        assert!("owner".parse::<Role>().is_err());
    }

    #[test]
    fn permissions_serialize_as_scoped_strings() {
        let json = serde_json::to_string(&Permission::InventoryWrite).unwrap();
        assert_eq!(json, "\"inventory:write\"");
        let role = serde_json::to_string(&Role::Manager).unwrap();
        assert_eq!(role, "\"manager\"");
    }
}
