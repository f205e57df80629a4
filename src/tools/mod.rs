//! 工具：Tool 接口、注册表、带超时与审计日志的执行器，以及扫描/校验协作工具

pub mod collaborators;
pub mod echo;
pub mod executor;
pub mod registry;
pub mod schema;

use std::sync::Arc;

pub use collaborators::{
    DiscoveryTarget, InventoryScanner, ResourceRecord, RuleValidator, Scanner, ScannerTool,
    ValidationReport, Validator, ValidatorTool,
};
pub use echo::EchoTool;
pub use executor::{ToolExecutor, DEFAULT_TOOL_TIMEOUT};
pub use registry::{Tool, ToolRegistry};
pub use schema::schema_value;

/// 默认工具集：echo、基于内联清单的 scanner、基于规则的 validator
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    registry.register(ScannerTool::new(Arc::new(InventoryScanner::default())));
    registry.register(ValidatorTool::new(Arc::new(RuleValidator)));
    registry
}
