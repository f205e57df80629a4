//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / execute），由 ToolRegistry 按名注册与查找。
//! crew 构建时从注册表中按 agent 声明的工具名取出子集，缺失的绑定属于结构性错误。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::ToolDeclaration;

/// 工具 trait：名称、描述（供模型理解）、参数 schema、异步执行（输入输出均为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（tool call 中的 name 字段）
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema，默认不限
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool re-registered, previous binding replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 已排序的工具名
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 取出指定名字的子集；任一名字未注册则返回该名字
    pub fn subset<I, S>(&self, names: I) -> Result<ToolRegistry, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tools = HashMap::new();
        for name in names {
            let name = name.as_ref();
            let tool = self.get(name).ok_or_else(|| name.to_string())?;
            tools.insert(name.to_string(), tool);
        }
        Ok(ToolRegistry { tools })
    }

    /// 生成推理请求中的工具声明（按名字排序，保证缓存键稳定）
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        self.tool_names()
            .into_iter()
            .filter_map(|name| {
                self.tools.get(&name).map(|tool| ToolDeclaration {
                    name,
                    description: tool.description().to_string(),
                    parameters: tool.parameters_schema(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;

    #[test]
    fn test_subset_reports_missing_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let subset = registry.subset(["echo"]).unwrap();
        assert_eq!(subset.tool_names(), vec!["echo".to_string()]);
        assert_eq!(registry.subset(["echo", "scanner"]).err().as_deref(), Some("scanner"));
    }

    #[test]
    fn test_declarations_sorted() {
        let registry = crate::tools::default_registry();
        let names: Vec<String> = registry.declarations().into_iter().map(|d| d.name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.contains(&"scanner".to_string()));
    }
}
