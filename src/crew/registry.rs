//! Crew 类型注册表
//!
//! 显式对象，由调用方构造后交给 CrewService；按 crew_type 查找工厂并结合上下文与输入实例化定义。

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::core::{CrewError, ExecutionContext};
use crate::crew::CrewDefinition;

pub type CrewFactory =
    Arc<dyn Fn(&ExecutionContext, &Value) -> Result<CrewDefinition, CrewError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct CrewRegistry {
    factories: HashMap<String, CrewFactory>,
}

impl CrewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, crew_type: impl Into<String>, factory: F)
    where
        F: Fn(&ExecutionContext, &Value) -> Result<CrewDefinition, CrewError> + Send + Sync + 'static,
    {
        self.factories.insert(crew_type.into(), Arc::new(factory));
    }

    /// 注册固定定义（例如从 TOML 加载的 crew）
    pub fn register_definition(&mut self, crew_type: impl Into<String>, definition: CrewDefinition) {
        self.register(crew_type, move |_, _| Ok(definition.clone()));
    }

    pub fn contains(&self, crew_type: &str) -> bool {
        self.factories.contains_key(crew_type)
    }

    pub fn crew_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// 实例化定义；未知类型属于结构性错误
    pub fn instantiate(
        &self,
        crew_type: &str,
        ctx: &ExecutionContext,
        inputs: &Value,
    ) -> Result<CrewDefinition, CrewError> {
        let factory = self
            .factories
            .get(crew_type)
            .ok_or_else(|| CrewError::Structural(format!("unknown crew type '{crew_type}'")))?;
        factory(ctx, inputs)
    }
}
