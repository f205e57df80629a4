//! 执行上下文：身份（组织、用户、会话）与关联 id
//!
//! 按值传入每个任务与推理调用，不在原处修改。缓存、限流与检查点都以它划分作用域。

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub organization_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub correlation_id: String,
}

impl ExecutionContext {
    pub fn new(organization_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            user_id: user_id.into(),
            session_id: None,
            correlation_id: format!("corr_{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// 缓存与用量归属的作用域：跨组织共享时为 None
    pub fn cache_scope(&self, share_across_orgs: bool) -> Option<String> {
        (!share_across_orgs).then(|| format!("org:{}", self.organization_id))
    }

    /// 限流作用域：按组织计数
    pub fn rate_scope(&self) -> String {
        format!("org:{}", self.organization_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scopes() {
        let ctx = ExecutionContext::new("acme", "u1").with_session("s1");
        assert_eq!(ctx.cache_scope(false).as_deref(), Some("org:acme"));
        assert_eq!(ctx.cache_scope(true), None);
        assert_eq!(ctx.rate_scope(), "org:acme");
        assert!(ctx.correlation_id.starts_with("corr_"));

        let other = ExecutionContext::new("acme", "u1");
        assert_ne!(ctx.correlation_id, other.correlation_id);
    }
}
