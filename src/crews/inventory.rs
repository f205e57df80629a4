//! inventory_assessment：资源盘点与迁移策略建议
//!
//! discover（scanner 工具）→ validate（validator 工具）→ recommend（策略师推理）。
//! recommend 带规则兜底：推理不可用时按停机要求、存储规模与关键程度选择迁移方式。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::CrewSection;
use crate::core::{CrewError, ExecutionContext};
use crate::crew::{AgentSpec, CrewConfig, CrewDefinition, OutputContract, Process, TaskInput, TaskSpec};
use crate::llm::CacheStrategy;
use crate::tools::ResourceRecord;

pub const CREW_TYPE: &str = "inventory_assessment";

/// 超过该存储总量（GB）时不做一次性迁移
const LARGE_STORAGE_GB: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStrategy {
    #[serde(rename = "Blue-Green Deployment")]
    BlueGreen,
    #[serde(rename = "Phased Migration")]
    Phased,
    #[serde(rename = "Big Bang")]
    BigBang,
}

impl MigrationStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            Self::BlueGreen => "Blue-Green Deployment",
            Self::Phased => "Phased Migration",
            Self::BigBang => "Big Bang",
        }
    }

    fn confidence(&self) -> f64 {
        match self {
            Self::BlueGreen => 0.9,
            Self::Phased => 0.8,
            Self::BigBang => 0.6,
        }
    }
}

/// 规则选择：零停机 → 蓝绿；大存储或关键资源 → 分阶段；其余一次性迁移
pub fn choose_strategy(zero_downtime: bool, total_storage_gb: f64, critical: bool) -> MigrationStrategy {
    if zero_downtime {
        MigrationStrategy::BlueGreen
    } else if total_storage_gb > LARGE_STORAGE_GB || critical {
        MigrationStrategy::Phased
    } else {
        MigrationStrategy::BigBang
    }
}

fn is_critical(level: Option<&str>) -> bool {
    level.is_some_and(|l| l.eq_ignore_ascii_case("critical") || l.eq_ignore_ascii_case("high"))
}

/// 从上游输出中取资源清单（validate 优先，其次 discover）
fn resources_from(input: &TaskInput) -> Vec<ResourceRecord> {
    ["validate", "discover"]
        .iter()
        .filter_map(|id| input.context.get(*id))
        .find_map(|output| output.get("resources").cloned())
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

/// recommend 任务的规则兜底
pub fn rule_based_recommendation(input: &TaskInput) -> Option<Value> {
    let resources = resources_from(input);
    let zero_downtime = input
        .inputs
        .get("zero_downtime")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let total_storage_gb: f64 = resources.iter().filter_map(|r| r.storage_gb).sum();
    let critical = resources.iter().any(|r| is_critical(r.criticality.as_deref()))
        || is_critical(input.inputs.get("criticality").and_then(Value::as_str));

    let strategy = choose_strategy(zero_downtime, total_storage_gb, critical);
    Some(json!({
        "strategy": strategy.label(),
        "confidence": strategy.confidence(),
        "rationale": format!(
            "{} resources, {total_storage_gb:.0} GB total, zero downtime required: {zero_downtime}, critical workloads: {critical}",
            resources.len()
        ),
        "source": "rules",
    }))
}

pub fn definition(
    section: &CrewSection,
    _ctx: &ExecutionContext,
    inputs: &Value,
) -> Result<CrewDefinition, CrewError> {
    if matches!(inputs.get("target"), Some(target) if !target.is_object()) {
        return Err(CrewError::Structural("inventory_assessment: 'target' must be an object".into()));
    }

    CrewDefinition::builder(CREW_TYPE)
        .process(Process::Sequential)
        .agent(
            AgentSpec::new(
                "inventory_analyst",
                "Infrastructure Inventory Analyst",
                "Build a complete and accurate inventory of the resources in scope",
            )
            .with_tools(&["scanner", "validator"]),
        )
        .agent(
            AgentSpec::new(
                "migration_strategist",
                "Cloud Migration Strategist",
                "Recommend the migration approach that fits the inventory and its constraints",
            )
            .with_backstory(
                "You have planned migrations for workloads of every size and know when downtime, data volume or criticality rule out a single cut-over.",
            ),
        )
        .task(
            TaskSpec::new("discover", "Discover the resources of the target", "inventory_analyst")
                .using_tool("scanner")
                .expecting(OutputContract::json(&["resources"])),
        )
        .task(
            TaskSpec::new("validate", "Check each discovered record for missing attributes", "inventory_analyst")
                .depends_on(["discover"])
                .using_tool("validator")
                .expecting(OutputContract::json(&["validations", "resources"]))
                .with_weight(0.5),
        )
        .task(
            TaskSpec::new(
                "recommend",
                "Recommend one migration strategy (Blue-Green Deployment, Phased Migration or Big Bang) for the validated inventory. \
                 Take downtime requirements, total storage and resource criticality into account. \
                 Include a short rationale and your confidence between 0 and 1.",
                "migration_strategist",
            )
            .depends_on(["validate"])
            .expecting(OutputContract::json(&["strategy", "rationale"]))
            .with_weight(2.0)
            .with_fallback(rule_based_recommendation),
        )
        .config(CrewConfig {
            memory: true,
            cache_strategy: Some(CacheStrategy::Moderate),
            max_workers: section.max_workers,
            wall_clock_budget_secs: section.wall_clock_budget_secs,
            ..CrewConfig::default()
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn input(inputs: Value, resources: Value) -> TaskInput {
        let mut context = BTreeMap::new();
        context.insert("validate".to_string(), json!({ "resources": resources }));
        TaskInput {
            inputs,
            context,
            simplified: false,
        }
    }

    #[test]
    fn test_strategy_rules() {
        assert_eq!(choose_strategy(true, 5000.0, true), MigrationStrategy::BlueGreen);
        assert_eq!(choose_strategy(false, 1000.5, false), MigrationStrategy::Phased);
        assert_eq!(choose_strategy(false, 10.0, true), MigrationStrategy::Phased);
        assert_eq!(choose_strategy(false, 1000.0, false), MigrationStrategy::BigBang);
    }

    #[test]
    fn test_rule_based_recommendation_reads_upstream_resources() {
        let resources = json!([
            {"id": "db", "name": "orders-db", "resource_type": "database", "storage_gb": 800.0, "criticality": "Low"},
            {"id": "vm", "name": "web", "resource_type": "vm", "storage_gb": 300.0}
        ]);
        let out = rule_based_recommendation(&input(json!({}), resources.clone())).unwrap();
        assert_eq!(out["strategy"], "Phased Migration");
        assert_eq!(out["confidence"], 0.8);

        let out = rule_based_recommendation(&input(json!({"zero_downtime": true}), resources)).unwrap();
        assert_eq!(out["strategy"], "Blue-Green Deployment");

        let out = rule_based_recommendation(&input(json!({}), json!([]))).unwrap();
        assert_eq!(out["strategy"], "Big Bang");
    }

    #[test]
    fn test_definition_is_sequential_and_valid() {
        let ctx = ExecutionContext::new("org", "user");
        let def = definition(&CrewSection::default(), &ctx, &json!({"target": {}})).unwrap();
        assert_eq!(def.process, Process::Sequential);
        assert_eq!(def.tasks.len(), 3);
        assert!(def.task("recommend").unwrap().fallback.is_some());
        assert!(definition(&CrewSection::default(), &ctx, &json!({"target": 3})).is_err());
    }
}
