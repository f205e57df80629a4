//! 内置 crew：inventory_assessment 与 form_assistant

pub mod form_assistant;
pub mod inventory;

use crate::config::CrewSection;
use crate::crew::CrewRegistry;

/// 注册全部内置 crew；crew 级 worker 上限与时间预算取自配置
pub fn builtin_registry(section: &CrewSection) -> CrewRegistry {
    let mut registry = CrewRegistry::new();

    let s = section.clone();
    registry.register(inventory::CREW_TYPE, move |ctx, inputs| {
        inventory::definition(&s, ctx, inputs)
    });

    let s = section.clone();
    registry.register(form_assistant::CREW_TYPE, move |ctx, inputs| {
        form_assistant::definition(&s, ctx, inputs)
    });

    registry
}
