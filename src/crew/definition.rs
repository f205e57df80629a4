//! Crew 定义与构建器
//!
//! 定义可以用 CrewBuilder 在代码中组装，也可以从 TOML 文档加载。
//! build / from_toml 都会做结构校验：agent 绑定、工具声明、依赖无环、manager 任务。

use std::collections::HashSet;

use serde::Deserialize;

use crate::core::CrewError;
use crate::crew::{AgentSpec, CrewConfig, OutputContract, Process, TaskGraph, TaskId, TaskSpec};

#[derive(Debug, Clone)]
pub struct CrewDefinition {
    pub name: String,
    pub process: Process,
    pub agents: Vec<AgentSpec>,
    /// 声明顺序即 FIFO 提交顺序
    pub tasks: Vec<TaskSpec>,
    /// hierarchical 模式下负责出计划与复核的任务
    pub manager_task: Option<TaskId>,
    pub config: CrewConfig,
}

impl CrewDefinition {
    pub fn builder(name: impl Into<String>) -> CrewBuilder {
        CrewBuilder {
            def: CrewDefinition {
                name: name.into(),
                process: Process::Sequential,
                agents: Vec::new(),
                tasks: Vec::new(),
                manager_task: None,
                config: CrewConfig::default(),
            },
        }
    }

    pub fn agent(&self, name: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn task(&self, id: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// 结构校验，成功时返回依赖图
    pub fn validate(&self) -> Result<TaskGraph, CrewError> {
        if self.tasks.is_empty() {
            return Err(CrewError::Structural(format!("crew '{}' has no tasks", self.name)));
        }

        let mut names = HashSet::new();
        for agent in &self.agents {
            if !names.insert(agent.name.as_str()) {
                return Err(CrewError::Structural(format!("duplicate agent '{}'", agent.name)));
            }
        }

        for task in &self.tasks {
            let agent = self.agent(&task.agent).ok_or_else(|| {
                CrewError::Structural(format!(
                    "task '{}' is bound to unknown agent '{}'",
                    task.id, task.agent
                ))
            })?;
            if let crate::crew::TaskAction::Tool { name } = &task.action {
                if !agent.tools.iter().any(|t| t == name) {
                    return Err(CrewError::Structural(format!(
                        "task '{}' uses tool '{}' which agent '{}' does not declare",
                        task.id, name, agent.name
                    )));
                }
            }
        }

        let graph = TaskGraph::build(&self.tasks)?;

        if self.process == Process::Hierarchical {
            let manager = self.manager_task.as_deref().ok_or_else(|| {
                CrewError::Structural(format!("hierarchical crew '{}' has no manager task", self.name))
            })?;
            if !graph.contains(manager) {
                return Err(CrewError::Structural(format!("manager task '{manager}' is not defined")));
            }
            if !graph.dependencies(manager).is_empty() {
                return Err(CrewError::Structural(format!(
                    "manager task '{manager}' must not depend on other tasks"
                )));
            }
        }
        Ok(graph)
    }

    /// 从 TOML 文档加载（不支持规则兜底闭包，需要时在代码中补充）
    pub fn from_toml(text: &str) -> Result<Self, CrewError> {
        let doc: CrewDocument = toml::from_str(text)
            .map_err(|e| CrewError::Structural(format!("invalid crew definition: {e}")))?;

        let tasks = doc
            .tasks
            .into_iter()
            .map(|t| {
                let mut spec = TaskSpec::new(t.id, t.description, t.agent)
                    .expecting(t.expected_output)
                    .depends_on(t.depends_on)
                    .with_weight(t.weight);
                if let Some(tool) = t.tool {
                    spec = spec.using_tool(tool);
                }
                if !t.critical {
                    spec = spec.non_critical();
                }
                spec
            })
            .collect();

        let def = CrewDefinition {
            name: doc.name,
            process: doc.process,
            agents: doc.agents,
            tasks,
            manager_task: doc.manager_task,
            config: doc.config,
        };
        def.validate()?;
        Ok(def)
    }
}

#[derive(Deserialize)]
struct CrewDocument {
    name: String,
    #[serde(default)]
    process: Process,
    #[serde(default)]
    manager_task: Option<TaskId>,
    #[serde(default)]
    config: CrewConfig,
    #[serde(default)]
    agents: Vec<AgentSpec>,
    #[serde(default)]
    tasks: Vec<TaskDocument>,
}

#[derive(Deserialize)]
struct TaskDocument {
    id: TaskId,
    description: String,
    agent: String,
    #[serde(default)]
    expected_output: OutputContract,
    #[serde(default)]
    depends_on: Vec<TaskId>,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default = "default_critical")]
    critical: bool,
    #[serde(default = "default_weight")]
    weight: f64,
}

fn default_critical() -> bool {
    true
}

fn default_weight() -> f64 {
    1.0
}

pub struct CrewBuilder {
    def: CrewDefinition,
}

impl CrewBuilder {
    pub fn process(mut self, process: Process) -> Self {
        self.def.process = process;
        self
    }

    pub fn agent(mut self, agent: AgentSpec) -> Self {
        self.def.agents.push(agent);
        self
    }

    pub fn task(mut self, task: TaskSpec) -> Self {
        self.def.tasks.push(task);
        self
    }

    /// 添加 manager 任务并切换为 hierarchical
    pub fn manager(mut self, task: TaskSpec) -> Self {
        self.def.manager_task = Some(task.id.clone());
        self.def.process = Process::Hierarchical;
        self.def.tasks.insert(0, task);
        self
    }

    pub fn config(mut self, config: CrewConfig) -> Self {
        self.def.config = config;
        self
    }

    pub fn build(self) -> Result<CrewDefinition, CrewError> {
        self.def.validate()?;
        Ok(self.def)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyst() -> AgentSpec {
        AgentSpec::new("analyst", "Analyst", "analyze").with_tools(&["scanner"])
    }

    #[test]
    fn test_builder_validates_bindings() {
        let ok = CrewDefinition::builder("c")
            .agent(analyst())
            .task(TaskSpec::new("scan", "scan", "analyst").using_tool("scanner"))
            .task(TaskSpec::new("report", "report", "analyst").depends_on(["scan"]))
            .build()
            .unwrap();
        assert_eq!(ok.tasks.len(), 2);

        let missing_agent = CrewDefinition::builder("c")
            .agent(analyst())
            .task(TaskSpec::new("t", "x", "ghost"))
            .build();
        assert!(matches!(missing_agent, Err(CrewError::Structural(_))));

        let undeclared_tool = CrewDefinition::builder("c")
            .agent(analyst())
            .task(TaskSpec::new("t", "x", "analyst").using_tool("validator"))
            .build();
        assert!(matches!(undeclared_tool, Err(CrewError::Structural(_))));
    }

    #[test]
    fn test_hierarchical_requires_manager() {
        let no_manager = CrewDefinition::builder("c")
            .process(Process::Hierarchical)
            .agent(analyst())
            .task(TaskSpec::new("t", "x", "analyst"))
            .build();
        assert!(matches!(no_manager, Err(CrewError::Structural(_))));

        let def = CrewDefinition::builder("c")
            .agent(analyst())
            .task(TaskSpec::new("t", "x", "analyst"))
            .manager(TaskSpec::new("plan", "plan the work", "analyst"))
            .build()
            .unwrap();
        assert_eq!(def.process, Process::Hierarchical);
        assert_eq!(def.tasks[0].id, "plan");
    }

    #[test]
    fn test_from_toml() {
        let text = r#"
name = "assessment"
process = "parallel"

[config]
max_workers = 2
share_across_orgs = true

[[agents]]
name = "analyst"
role = "Infrastructure Analyst"
goal = "Understand the estate"
tools = ["scanner"]

[[tasks]]
id = "discover"
description = "Discover resources"
agent = "analyst"
tool = "scanner"

[[tasks]]
id = "summarize"
description = "Summarize findings"
agent = "analyst"
depends_on = ["discover"]
critical = false
weight = 0.5

[tasks.expected_output]
kind = "json"
required_keys = ["summary"]
"#;
        let def = CrewDefinition::from_toml(text).unwrap();
        assert_eq!(def.process, Process::Parallel);
        assert_eq!(def.config.max_workers, 2);
        assert!(def.config.share_across_orgs);
        let summarize = def.task("summarize").unwrap();
        assert!(!summarize.critical);
        assert_eq!(summarize.weight, 0.5);
        assert_eq!(summarize.expected_output, OutputContract::json(&["summary"]));
        assert_eq!(def.agent("analyst").unwrap().temperature, 0.3);

        let cyclic = r#"
name = "bad"
[[agents]]
name = "a"
role = "r"
goal = "g"
[[tasks]]
id = "x"
description = "x"
agent = "a"
depends_on = ["y"]
[[tasks]]
id = "y"
description = "y"
agent = "a"
depends_on = ["x"]
"#;
        assert!(matches!(CrewDefinition::from_toml(cyclic), Err(CrewError::Structural(_))));
    }
}
