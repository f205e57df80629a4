//! form_assistant：表单填写辅助
//!
//! 三个互不依赖的任务并行执行：字段建议、字段校验、整表一致性检查。
//! 输出结构由 schemars 生成 schema 写入任务描述；字段校验带规则兜底（必填项为空即不通过）。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::CrewSection;
use crate::core::{CrewError, ExecutionContext};
use crate::crew::{AgentSpec, CrewConfig, CrewDefinition, OutputContract, Process, TaskInput, TaskSpec};
use crate::llm::CacheStrategy;
use crate::tools::schema_value;

pub const CREW_TYPE: &str = "form_assistant";

/// crew 输入
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormContext {
    pub form_type: String,
    #[serde(default)]
    pub current_values: Map<String, Value>,
    /// 字段名 → 元数据（required、pattern、说明等）
    #[serde(default)]
    pub field_metadata: Map<String, Value>,
    /// 需要建议或校验的字段
    #[serde(default)]
    pub field: Option<String>,
    /// 待校验的值；为空时不生成校验任务
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FieldSuggestion {
    pub field_name: String,
    pub suggested_value: String,
    /// 0..=1
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackSeverity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FieldValidation {
    pub field_name: String,
    pub is_valid: bool,
    pub confidence: f64,
    /// 面向用户的反馈
    pub message: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
    pub severity: FeedbackSeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConsistencyIssue {
    pub fields: Vec<String>,
    pub description: String,
    pub severity: FeedbackSeverity,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConsistencyReport {
    pub issues: Vec<ConsistencyIssue>,
    /// 可由其他字段推导自动填写的字段
    #[serde(default)]
    pub auto_completable: Vec<String>,
    pub confidence: f64,
}

fn schema_hint<T: JsonSchema>() -> String {
    format!("The JSON object must follow this schema: {}", schema_value::<T>())
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// 字段校验的规则兜底：只判断必填
pub fn rule_based_validation(input: &TaskInput) -> Option<Value> {
    let form: FormContext = serde_json::from_value(input.inputs.clone()).ok()?;
    let field = form.field?;
    let value = form.value.unwrap_or(Value::Null);
    let required = form
        .field_metadata
        .get(&field)
        .and_then(|m| m.get("required"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let validation = if required && is_blank(&value) {
        FieldValidation {
            field_name: field.clone(),
            is_valid: false,
            confidence: 0.7,
            message: format!("'{field}' is required"),
            suggestions: vec![format!("Provide a value for '{field}'")],
            severity: FeedbackSeverity::Error,
        }
    } else {
        FieldValidation {
            field_name: field,
            is_valid: true,
            confidence: 0.5,
            message: "No rule violations found".into(),
            suggestions: Vec::new(),
            severity: FeedbackSeverity::Info,
        }
    };
    serde_json::to_value(validation).ok()
}

pub fn definition(
    section: &CrewSection,
    _ctx: &ExecutionContext,
    inputs: &Value,
) -> Result<CrewDefinition, CrewError> {
    let form: FormContext = serde_json::from_value(inputs.clone())
        .map_err(|e| CrewError::Structural(format!("form_assistant: invalid inputs: {e}")))?;
    if form.form_type.trim().is_empty() {
        return Err(CrewError::Structural("form_assistant: 'form_type' is required".into()));
    }
    let values = Value::Object(form.current_values.clone());

    let mut builder = CrewDefinition::builder(CREW_TYPE)
        .process(Process::Parallel)
        .agent(
            AgentSpec::new(
                "form_assistant",
                "Form Assistant Specialist",
                "Provide context-aware suggestions and validation for form fields",
            )
            .with_backstory(
                "You know data validation, user experience and the domain requirements of discovery, configuration and data collection forms.",
            ),
        );

    if let Some(field) = &form.field {
        let metadata = form.field_metadata.get(field).cloned().unwrap_or(Value::Null);
        builder = builder.task(
            TaskSpec::new(
                "suggest",
                format!(
                    "Suggest a value for the field '{field}' of a '{}' form. Current values: {values}. Field metadata: {metadata}. \
                     Consider related fields, common patterns and domain requirements. Give up to three alternatives. {}",
                    form.form_type,
                    schema_hint::<FieldSuggestion>()
                ),
                "form_assistant",
            )
            .expecting(OutputContract::json(&["suggested_value", "confidence", "reasoning"]))
            .non_critical(),
        );

        if let Some(value) = &form.value {
            builder = builder.task(
                TaskSpec::new(
                    "validate",
                    format!(
                        "Validate the value {value} for the field '{field}' of a '{}' form. Field metadata: {metadata}. \
                         Check field requirements, domain rules and consistency with the other values: {values}. {}",
                        form.form_type,
                        schema_hint::<FieldValidation>()
                    ),
                    "form_assistant",
                )
                .expecting(OutputContract::json(&["is_valid", "message", "severity"]))
                .with_fallback(rule_based_validation),
            );
        }
    }

    builder
        .task(
            TaskSpec::new(
                "consistency",
                format!(
                    "Check the whole '{}' form for logical inconsistencies, missing relationships and data quality issues. \
                     Values: {values}. List fields that could be completed from the others. {}",
                    form.form_type,
                    schema_hint::<ConsistencyReport>()
                ),
                "form_assistant",
            )
            .expecting(OutputContract::json(&["issues"])),
        )
        .config(CrewConfig {
            memory: true,
            cache_strategy: Some(CacheStrategy::Aggressive),
            max_workers: section.max_workers,
            wall_clock_budget_secs: section.wall_clock_budget_secs,
            ..CrewConfig::default()
        })
        .build()
}
