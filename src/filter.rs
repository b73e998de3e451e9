//! 事件过滤器
//!
//! 过滤器组成一棵二叉树：`a & b`、`a | b` 从左到右短路求值。叶子过滤器报错
//! 或 panic 时视为 `false`，不会影响调用方。

pub mod builtin;
pub mod registry;

pub use builtin::{
    Always, Custom, GroupOnly, GroupRole, GroupRoleAtLeast, MessageSent, PrivateOnly, RoleAtLeast, SenderIsNotSelf,
    SenderIsSelf,
};
pub use registry::{FilterRegistry, FilteredHandler};

use crate::config::CoreConfig;
use crate::event::MessageEvent;
use std::collections::HashSet;
use std::fmt;
use std::ops::{BitAnd, BitOr};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

// ============================================================================
// 1. 权限
// ============================================================================

/// 机器人层面的权限等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    User,
    Admin,
    Root,
}

pub trait RoleProvider: Send + Sync {
    fn role_of(&self, user_id: i64) -> Role;
}

#[derive(Debug, Default)]
struct RoleSets {
    admins: HashSet<i64>,
    roots: HashSet<i64>,
}

/// 权限表，初始值来自配置文件，运行时可增删
#[derive(Debug, Default)]
pub struct RoleTable {
    sets: RwLock<RoleSets>,
}

impl RoleTable {
    pub fn new(admins: impl IntoIterator<Item = i64>, roots: impl IntoIterator<Item = i64>) -> Self {
        Self {
            sets: RwLock::new(RoleSets {
                admins: admins.into_iter().collect(),
                roots: roots.into_iter().collect(),
            }),
        }
    }

    pub fn from_config(core: &CoreConfig) -> Self {
        Self::new(core.admin_users.iter().copied(), core.root_users.iter().copied())
    }

    /// 授予权限，已拥有时返回 false；`Role::User` 无需授予
    pub fn assign(&self, user_id: i64, role: Role) -> bool {
        let mut sets = self.sets.write().unwrap_or_else(PoisonError::into_inner);
        let added = match role {
            Role::User => false,
            Role::Admin => sets.admins.insert(user_id),
            Role::Root => sets.roots.insert(user_id),
        };
        if added {
            info!(target: "Filter", "授予 {} {:?} 权限", user_id, role);
        }
        added
    }

    /// 收回权限，未拥有时返回 false
    pub fn unassign(&self, user_id: i64, role: Role) -> bool {
        let mut sets = self.sets.write().unwrap_or_else(PoisonError::into_inner);
        let removed = match role {
            Role::User => false,
            Role::Admin => sets.admins.remove(&user_id),
            Role::Root => sets.roots.remove(&user_id),
        };
        if removed {
            info!(target: "Filter", "收回 {} {:?} 权限", user_id, role);
        }
        removed
    }

    /// 按 QQ 号排序的 (管理员, 超级管理员)
    pub fn members(&self) -> (Vec<i64>, Vec<i64>) {
        let sets = self.sets.read().unwrap_or_else(PoisonError::into_inner);
        let mut admins: Vec<i64> = sets.admins.iter().copied().collect();
        let mut roots: Vec<i64> = sets.roots.iter().copied().collect();
        admins.sort_unstable();
        roots.sort_unstable();
        (admins, roots)
    }

    /// 写回配置，用于持久化
    pub fn write_to(&self, core: &mut CoreConfig) {
        let (admins, roots) = self.members();
        core.admin_users = admins;
        core.root_users = roots;
    }
}

impl RoleProvider for RoleTable {
    fn role_of(&self, user_id: i64) -> Role {
        let sets = self.sets.read().unwrap_or_else(PoisonError::into_inner);
        if sets.roots.contains(&user_id) {
            Role::Root
        } else if sets.admins.contains(&user_id) {
            Role::Admin
        } else {
            Role::User
        }
    }
}

// ============================================================================
// 2. 过滤器树
// ============================================================================

pub struct FilterContext<'a> {
    pub event: &'a MessageEvent,
    pub roles: &'a dyn RoleProvider,
}

impl FilterContext<'_> {
    pub fn role(&self) -> Role {
        self.roles.role_of(self.event.user_id())
    }
}

pub trait EventFilter: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self, ctx: &FilterContext<'_>) -> anyhow::Result<bool>;
}

#[derive(Clone)]
pub enum Filter {
    Leaf(Arc<dyn EventFilter>),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
}

impl Filter {
    pub fn new(filter: impl EventFilter + 'static) -> Self {
        Self::Leaf(Arc::new(filter))
    }

    pub fn and(self, other: Filter) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Filter) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    /// 把多个过滤器隐式 AND 起来，空列表返回 None
    pub fn combine(filters: impl IntoIterator<Item = Filter>) -> Option<Filter> {
        filters.into_iter().reduce(Filter::and)
    }

    pub fn check(&self, ctx: &FilterContext<'_>) -> bool {
        match self {
            Self::Leaf(f) => match std::panic::catch_unwind(AssertUnwindSafe(|| f.check(ctx))) {
                Ok(Ok(passed)) => passed,
                Ok(Err(e)) => {
                    warn!(target: "Filter", "过滤器 {} 出错，按拒绝处理: {:#}", f.name(), e);
                    false
                }
                Err(_) => {
                    warn!(target: "Filter", "过滤器 {} panic，按拒绝处理", f.name());
                    false
                }
            },
            Self::And(a, b) => a.check(ctx) && b.check(ctx),
            Self::Or(a, b) => a.check(ctx) || b.check(ctx),
        }
    }
}

/// 全部通过才返回 true
pub fn check_all(filters: &[Filter], ctx: &FilterContext<'_>) -> bool {
    filters.iter().all(|f| f.check(ctx))
}

impl BitAnd for Filter {
    type Output = Filter;

    fn bitand(self, rhs: Filter) -> Filter {
        self.and(rhs)
    }
}

impl BitOr for Filter {
    type Output = Filter;

    fn bitor(self, rhs: Filter) -> Filter {
        self.or(rhs)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leaf(leaf) => f.write_str(leaf.name()),
            Self::And(a, b) => write!(f, "({a} & {b})"),
            Self::Or(a, b) => write!(f, "({a} | {b})"),
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Filter{self}")
    }
}
