//! crewline 命令行入口
//!
//! 用法：crewline <crew_type> [inputs-json]
//! 初始化日志、加载配置、选择推理后端并运行一次 crew，结果以 JSON 打印；Ctrl+C 取消运行。

use std::sync::Arc;

use anyhow::{bail, Context};
use crewline::{
    config::load_config,
    core::ExecutionContext,
    crews::builtin_registry,
    llm::{InferenceBackend, MockBackend, OpenAiBackend},
    service::CrewService,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(crew_type) = args.next() else {
        bail!("usage: crewline <crew_type> [inputs-json]");
    };
    let inputs: serde_json::Value = match args.next() {
        Some(raw) => serde_json::from_str(&raw).context("inputs must be a JSON document")?,
        None => serde_json::json!({}),
    };

    let cfg = load_config(std::env::var_os("CREWLINE_CONFIG").map(Into::into))
        .context("Failed to load configuration")?;

    let backend: Arc<dyn InferenceBackend> = match cfg.llm.resolve_api_key() {
        Some(key) if cfg.llm.provider != "mock" => Arc::new(
            OpenAiBackend::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                &key,
                cfg.llm.request_timeout(),
            )
            .context("Failed to create inference backend")?,
        ),
        _ => {
            tracing::warn!("no API key configured, using mock inference backend");
            Arc::new(MockBackend::new())
        }
    };

    let registry = builtin_registry(&cfg.crew);
    if !registry.contains(&crew_type) {
        bail!(
            "unknown crew type '{crew_type}', available: {}",
            registry.crew_types().join(", ")
        );
    }
    let service = Arc::new(
        CrewService::from_config(&cfg, backend, registry)
            .await
            .context("Failed to build crew service")?,
    );

    let organization = std::env::var("CREWLINE_ORG").unwrap_or_else(|_| "local".into());
    let user = std::env::var("USER").unwrap_or_else(|_| "cli".into());
    let ctx = ExecutionContext::new(organization, user);

    let shutdown = service.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling run");
            shutdown.shutdown();
        }
    });

    let result = service
        .execute(&crew_type, ctx, inputs)
        .await
        .context("Crew run failed")?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
