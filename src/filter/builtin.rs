use super::{EventFilter, FilterContext, Role};
use crate::event::EventKind;
use std::collections::HashSet;
use std::sync::Arc;

/// 仅群聊，可限定群号
#[derive(Debug, Clone, Default)]
pub struct GroupOnly {
    groups: Option<HashSet<i64>>,
}

impl GroupOnly {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn within(groups: impl IntoIterator<Item = i64>) -> Self {
        Self {
            groups: Some(groups.into_iter().collect()),
        }
    }
}

impl EventFilter for GroupOnly {
    fn name(&self) -> &str {
        "group"
    }

    fn check(&self, ctx: &FilterContext<'_>) -> anyhow::Result<bool> {
        if !ctx.event.is_group() {
            return Ok(false);
        }
        Ok(match (&self.groups, ctx.event.group_id()) {
            (None, _) => true,
            (Some(set), Some(gid)) => set.contains(&gid),
            (Some(_), None) => false,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PrivateOnly;

impl EventFilter for PrivateOnly {
    fn name(&self) -> &str {
        "private"
    }

    fn check(&self, ctx: &FilterContext<'_>) -> anyhow::Result<bool> {
        Ok(ctx.event.is_private())
    }
}

/// 机器人权限不低于给定等级
#[derive(Debug, Clone, Copy)]
pub struct RoleAtLeast(pub Role);

impl EventFilter for RoleAtLeast {
    fn name(&self) -> &str {
        match self.0 {
            Role::User => "user",
            Role::Admin => "admin",
            Role::Root => "root",
        }
    }

    fn check(&self, ctx: &FilterContext<'_>) -> anyhow::Result<bool> {
        Ok(ctx.role() >= self.0)
    }
}

/// 群内身份
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GroupRole {
    Member,
    Admin,
    Owner,
}

impl GroupRole {
    pub fn parse(role: &str) -> Option<Self> {
        match role {
            "member" => Some(Self::Member),
            "admin" => Some(Self::Admin),
            "owner" => Some(Self::Owner),
            _ => None,
        }
    }
}

/// 群内身份不低于给定等级，私聊一律不通过
#[derive(Debug, Clone, Copy)]
pub struct GroupRoleAtLeast(pub GroupRole);

impl EventFilter for GroupRoleAtLeast {
    fn name(&self) -> &str {
        match self.0 {
            GroupRole::Member => "group_member",
            GroupRole::Admin => "group_admin",
            GroupRole::Owner => "group_owner",
        }
    }

    fn check(&self, ctx: &FilterContext<'_>) -> anyhow::Result<bool> {
        if !ctx.event.is_group() {
            return Ok(false);
        }
        Ok(ctx
            .event
            .sender_role()
            .and_then(GroupRole::parse)
            .is_some_and(|r| r >= self.0))
    }
}

/// 机器人自己发出的消息
#[derive(Debug, Clone, Copy)]
pub struct SenderIsSelf;

impl EventFilter for SenderIsSelf {
    fn name(&self) -> &str {
        "self"
    }

    fn check(&self, ctx: &FilterContext<'_>) -> anyhow::Result<bool> {
        Ok(ctx.event.is_from_self())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SenderIsNotSelf;

impl EventFilter for SenderIsNotSelf {
    fn name(&self) -> &str {
        "non_self"
    }

    fn check(&self, ctx: &FilterContext<'_>) -> anyhow::Result<bool> {
        Ok(!ctx.event.is_from_self())
    }
}

/// 机器人自身发出并被上报的消息（`message_sent`，或发送者即自身）
#[derive(Debug, Clone, Copy)]
pub struct MessageSent;

impl EventFilter for MessageSent {
    fn name(&self) -> &str {
        "message_sent"
    }

    fn check(&self, ctx: &FilterContext<'_>) -> anyhow::Result<bool> {
        Ok(ctx.event.kind() == Some(EventKind::MessageSent) || ctx.event.is_from_self())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Always;

impl EventFilter for Always {
    fn name(&self) -> &str {
        "always"
    }

    fn check(&self, _ctx: &FilterContext<'_>) -> anyhow::Result<bool> {
        Ok(true)
    }
}

type Predicate = dyn Fn(&FilterContext<'_>) -> anyhow::Result<bool> + Send + Sync;

/// 自定义谓词
#[derive(Clone)]
pub struct Custom {
    name: String,
    predicate: Arc<Predicate>,
}

impl Custom {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&FilterContext<'_>) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }
}

impl EventFilter for Custom {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, ctx: &FilterContext<'_>) -> anyhow::Result<bool> {
        (self.predicate)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{MessageEvent, fixtures};
    use crate::filter::RoleTable;
    use serde_json::json;

    fn check(filter: &dyn EventFilter, payload: serde_json::Value) -> bool {
        let ev = MessageEvent::from_payload(Arc::new(payload)).unwrap();
        let roles = RoleTable::new([10001], []);
        filter
            .check(&FilterContext {
                event: &ev,
                roles: &roles,
            })
            .unwrap()
    }

    #[test]
    fn group_only_respects_group_set() {
        assert!(check(&GroupOnly::any(), fixtures::group_message("x")));
        assert!(check(&GroupOnly::within([123456]), fixtures::group_message("x")));
        assert!(!check(&GroupOnly::within([1]), fixtures::group_message("x")));
        assert!(!check(&GroupOnly::any(), fixtures::private_message("x")));
        assert!(check(&PrivateOnly, fixtures::private_message("x")));
    }

    #[test]
    fn group_role_uses_sender_role() {
        let mut owner = fixtures::group_message("x");
        owner["sender"]["role"] = json!("owner");
        assert!(check(&GroupRoleAtLeast(GroupRole::Admin), owner.clone()));
        assert!(check(&GroupRoleAtLeast(GroupRole::Owner), owner));
        assert!(!check(&GroupRoleAtLeast(GroupRole::Admin), fixtures::group_message("x")));
        assert!(!check(&GroupRoleAtLeast(GroupRole::Member), fixtures::private_message("x")));
    }

    #[test]
    fn role_and_self_filters() {
        assert!(check(&RoleAtLeast(Role::Admin), fixtures::group_message("x")));
        assert!(!check(&RoleAtLeast(Role::Root), fixtures::group_message("x")));

        let mut own = fixtures::group_message("x");
        own["user_id"] = json!(999);
        assert!(check(&SenderIsSelf, own.clone()));
        assert!(!check(&SenderIsNotSelf, own));
        assert!(check(&SenderIsNotSelf, fixtures::group_message("x")));
    }

    #[test]
    fn message_sent_matches_own_reports_only() {
        let mut sent = fixtures::group_message("x");
        sent["post_type"] = json!("message_sent");
        sent["user_id"] = json!(999);
        assert!(check(&MessageSent, sent));

        let mut echoed = fixtures::private_message("x");
        echoed["user_id"] = json!(999);
        assert!(check(&MessageSent, echoed));

        assert!(!check(&MessageSent, fixtures::group_message("x")));
    }
}
