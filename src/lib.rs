//! crewline - 多 Agent crew 编排与容错引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 执行上下文、crate 级错误、执行监管（取消令牌）
//! - **llm**: 推理客户端（缓存、Token 预算、限流、重试、熔断）与后端实现（OpenAI 兼容 / Mock）
//! - **recovery**: 错误分类、恢复策略选择、熔断器、恢复引擎
//! - **state**: 运行状态、检查点与 Agent 记忆的存储（内存 / SQLite）
//! - **tools**: Tool 接口、注册表与执行器，扫描 / 校验协作工具
//! - **crew**: crew 定义、依赖图、Agent、sequential / parallel / hierarchical 执行器
//! - **crews**: 内置 crew（inventory_assessment、form_assistant）
//! - **service**: 对外接口 CrewService（提交、查询、取消、恢复）

pub mod config;
pub mod core;
pub mod crew;
pub mod crews;
pub mod llm;
pub mod recovery;
pub mod service;
pub mod state;
pub mod tools;

pub use crew::{CrewDefinition, CrewExecutor, CrewRegistry, CrewResult};
pub use service::{CrewService, ExecutionStatus};
