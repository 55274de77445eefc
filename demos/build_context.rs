//! Builds one context from in-memory sources and prints it
//!
//! Run with `cargo run --example build_context [config.toml]`.

use anyhow::Result;
use context_engine::config::Config;
use context_engine::context::sources::{
    ContextScope, InheritedScopeSource, RecentWindowSource, ScopedContext, SharedPoolSource,
    SystemPromptSource, UserInputSource, WorkingMemorySource,
};
use context_engine::context::{
    AdaptiveBudgetManager, BuildEvent, ContextCollector, ContextCompactor, ContextOrchestrator,
    ExtractiveSummarizer, LLMSummarizer, Message, Summarizer, TokenAccountant, WorkingMemory,
};
use context_engine::logging::init_tracing;
use context_engine::metrics::METRICS;
use context_engine::pool::SharedMemoryPool;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;
    init_tracing(&config.logging)?;

    let accountant = Arc::new(TokenAccountant::from_config(&config.engine));
    info!(estimating = accountant.is_estimating(), "Token accountant ready");

    let history = Arc::new(RwLock::new(vec![
        Message::user("The nightly build failed on the integration suite."),
        Message::assistant("The failure is a timeout in the payments test."),
        Message::user("Can we raise the timeout safely?"),
    ]));

    let mut memory = WorkingMemory::new(config.sources.working_memory_capacity);
    memory.put("hypothesis", "Payments sandbox is slow after the region move", 0.8);
    let memory = Arc::new(RwLock::new(memory));

    let scope = Arc::new(RwLock::new(vec![ScopedContext::new(
        ContextScope::Inherited,
        "parent-task",
        "Stabilize CI before Friday's release",
    )]));

    let pool = Arc::new(SharedMemoryPool::new());
    let entry = pool
        .write("ci/owner", "infra team", "triage-agent", None, None)
        .await?;
    pool.write(
        "ci/owner",
        "payments team",
        "routing-agent",
        Some(entry.version),
        None,
    )
    .await?;

    let collector = ContextCollector::new(accountant.clone())
        .with_source(Arc::new(UserInputSource::new()))
        .with_source(Arc::new(SystemPromptSource::new(
            "Cite the test name when discussing failures.",
        )))
        .with_source(Arc::new(RecentWindowSource::new(
            history,
            config.sources.recent_window_size,
        )))
        .with_source(Arc::new(WorkingMemorySource::new(memory)))
        .with_source(Arc::new(InheritedScopeSource::new(scope)))
        .with_source(Arc::new(SharedPoolSource::new(
            pool,
            config.sources.shared_pool_prefix.clone(),
            config.sources.shared_pool_limit,
        )));

    let summarizer: Arc<dyn Summarizer> = if config.summarizer.enabled {
        Arc::new(LLMSummarizer::new(config.summarizer.clone())?)
    } else {
        Arc::new(ExtractiveSummarizer::default())
    };
    let compactor = ContextCompactor::new(accountant.clone()).with_summarizer(summarizer);

    let policy = Arc::new(AdaptiveBudgetManager::from_config(&config, accountant.clone()));
    let phase = policy.update_phase(2, 10);
    info!(phase = phase.as_str(), "Task phase set");

    let orchestrator = Arc::new(ContextOrchestrator::new(
        policy,
        collector,
        compactor,
        accountant.clone(),
    ));

    let info = orchestrator.get_budget_info("You are a CI triage assistant.");
    println!("{}", serde_json::to_string_pretty(&info)?);

    let mut events = orchestrator.clone().build_context_stream(
        "What timeout should the payments test use?".to_string(),
        "You are a CI triage assistant.".to_string(),
        0.1,
    );

    while let Some(event) = events.recv().await {
        match event {
            BuildEvent::Completed { messages, report } => {
                for message in &messages {
                    println!("[{}] {}", message.role.as_str(), message.content);
                }
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            other => info!(phase = ?other.phase(), "{}", serde_json::to_string(&other)?),
        }
    }

    println!("token cache: {:?}", accountant.cache_stats());
    print!("{}", METRICS.export_prometheus());
    Ok(())
}
