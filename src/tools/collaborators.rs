//! 外部协作能力：资源扫描（Scanner）与资源校验（Validator）
//!
//! 执行器只通过 Tool 接口调用它们；具体的云资源枚举逻辑由注入的实现负责。
//! 这里附带两个不依赖外部服务的实现：读取内联清单的 InventoryScanner 与基于字段完整度的 RuleValidator。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::schema::schema_value;
use super::Tool;

/// 扫描得到的资源记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceRecord {
    pub id: String,
    pub name: String,
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// Critical / High / Medium / Low
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criticality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_gb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// 扫描目标
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DiscoveryTarget {
    /// 只返回该 provider 的资源；为空表示全部
    #[serde(default)]
    pub provider: Option<String>,
    /// 调用方直接提供的资源清单
    #[serde(default)]
    pub resources: Vec<ResourceRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ValidationReport {
    pub record_id: String,
    /// 0..=1
    pub score: f64,
    pub gaps: Vec<String>,
}

#[async_trait]
pub trait Scanner: Send + Sync {
    async fn discover(&self, target: &DiscoveryTarget) -> Result<Vec<ResourceRecord>, String>;
}

#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, record: &ResourceRecord) -> Result<ValidationReport, String>;
}

/// 读取预置记录与目标内联清单的扫描器
#[derive(Debug, Clone, Default)]
pub struct InventoryScanner {
    records: Vec<ResourceRecord>,
}

impl InventoryScanner {
    pub fn new(records: Vec<ResourceRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl Scanner for InventoryScanner {
    async fn discover(&self, target: &DiscoveryTarget) -> Result<Vec<ResourceRecord>, String> {
        let matches = |r: &ResourceRecord| match (&target.provider, &r.provider) {
            (Some(wanted), Some(actual)) => wanted.eq_ignore_ascii_case(actual),
            (Some(_), None) => false,
            (None, _) => true,
        };
        Ok(self
            .records
            .iter()
            .chain(target.resources.iter())
            .filter(|r| matches(r))
            .cloned()
            .collect())
    }
}

/// 按关键字段完整度打分
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleValidator;

#[async_trait]
impl Validator for RuleValidator {
    async fn validate(&self, record: &ResourceRecord) -> Result<ValidationReport, String> {
        let checks = [
            ("environment", record.environment.is_some()),
            ("criticality", record.criticality.is_some()),
            ("storage_gb", record.storage_gb.is_some()),
            ("owner", record.owner.is_some()),
        ];
        let gaps: Vec<String> = checks
            .iter()
            .filter(|(_, present)| !present)
            .map(|(field, _)| format!("missing {field}"))
            .collect();
        let score = (checks.len() - gaps.len()) as f64 / checks.len() as f64;
        Ok(ValidationReport {
            record_id: record.id.clone(),
            score,
            gaps,
        })
    }
}

/// 工具参数可以直接给出字段，也可以是任务输入 `{"inputs": {...}, "context": {...}}`
fn argument<'a>(args: &'a Value, key: &str) -> Option<&'a Value> {
    args.get(key)
        .or_else(|| args.get("inputs").and_then(|inputs| inputs.get(key)))
}

/// Scanner 适配为工具 `scanner`
pub struct ScannerTool {
    scanner: Arc<dyn Scanner>,
}

impl ScannerTool {
    pub fn new(scanner: Arc<dyn Scanner>) -> Self {
        Self { scanner }
    }
}

#[async_trait]
impl Tool for ScannerTool {
    fn name(&self) -> &str {
        "scanner"
    }

    fn description(&self) -> &str {
        "Discover infrastructure resources for a target. Args: {\"target\": {\"provider\": \"aws\"}}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"target": schema_value::<DiscoveryTarget>()},
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let target: DiscoveryTarget = match argument(&args, "target") {
            Some(v) => serde_json::from_value(v.clone()).map_err(|e| format!("invalid target: {e}"))?,
            None => DiscoveryTarget::default(),
        };
        let resources = self.scanner.discover(&target).await?;
        Ok(json!({
            "count": resources.len(),
            "resources": resources,
        }))
    }
}

/// Validator 适配为工具 `validator`
pub struct ValidatorTool {
    validator: Arc<dyn Validator>,
}

impl ValidatorTool {
    pub fn new(validator: Arc<dyn Validator>) -> Self {
        Self { validator }
    }

    /// 从 `records` 参数或上游任务输出中的 `resources` 收集记录
    fn collect_records(args: &Value) -> Result<Vec<ResourceRecord>, String> {
        let mut raw: Vec<Value> = Vec::new();
        if let Some(records) = args.get("records").and_then(Value::as_array) {
            raw.extend(records.iter().cloned());
        } else if let Some(context) = args.get("context").and_then(Value::as_object) {
            for output in context.values() {
                if let Some(resources) = output.get("resources").and_then(Value::as_array) {
                    raw.extend(resources.iter().cloned());
                }
            }
        }
        raw.into_iter()
            .map(|v| serde_json::from_value(v).map_err(|e| format!("invalid resource record: {e}")))
            .collect()
    }
}

#[async_trait]
impl Tool for ValidatorTool {
    fn name(&self) -> &str {
        "validator"
    }

    fn description(&self) -> &str {
        "Validate discovered resources and report completeness gaps. Args: {\"records\": [...]}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "records": {"type": "array", "items": schema_value::<ResourceRecord>()}
            },
            "required": ["records"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let records = Self::collect_records(&args)?;
        let mut reports = Vec::with_capacity(records.len());
        for record in &records {
            reports.push(self.validator.validate(record).await?);
        }
        let average = if reports.is_empty() {
            0.0
        } else {
            reports.iter().map(|r| r.score).sum::<f64>() / reports.len() as f64
        };
        Ok(json!({
            "validations": reports,
            "average_score": average,
            "resources": records,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, provider: &str) -> ResourceRecord {
        ResourceRecord {
            id: id.into(),
            name: format!("{id}-name"),
            resource_type: "vm".into(),
            provider: Some(provider.into()),
            environment: Some("prod".into()),
            criticality: None,
            storage_gb: Some(120.0),
            owner: None,
        }
    }

    #[tokio::test]
    async fn test_scanner_filters_by_provider() {
        let scanner = InventoryScanner::new(vec![record("a", "aws"), record("b", "azure")]);
        let tool = ScannerTool::new(Arc::new(scanner));
        let out = tool
            .execute(json!({"inputs": {"target": {"provider": "AWS"}}}))
            .await
            .unwrap();
        assert_eq!(out["count"], 1);
        assert_eq!(out["resources"][0]["id"], "a");

        let all = tool.execute(json!({})).await.unwrap();
        assert_eq!(all["count"], 2);
    }

    #[tokio::test]
    async fn test_validator_reads_upstream_resources() {
        let tool = ValidatorTool::new(Arc::new(RuleValidator));
        let args = json!({
            "inputs": {},
            "context": {"discover": {"resources": [record("a", "aws")]}}
        });
        let out = tool.execute(args).await.unwrap();
        assert_eq!(out["validations"][0]["score"], 0.5);
        assert_eq!(out["validations"][0]["gaps"].as_array().unwrap().len(), 2);
        assert_eq!(out["average_score"], 0.5);
    }

    #[tokio::test]
    async fn test_validator_rejects_malformed_records() {
        let tool = ValidatorTool::new(Arc::new(RuleValidator));
        let err = tool.execute(json!({"records": [{"id": 1}]})).await.unwrap_err();
        assert!(err.contains("invalid resource record"));
    }
}
