use anyhow::Result;
use remote_cua::agent::DiskScreenshotStore;
use remote_cua::{Agent, AgentConfig, CuaClient, CuaConfig, LoopEvent, ScrapybaraClient, ScrapybaraConfig, SessionState, Turn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let task = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Open a browser and search for the weather in Paris.".to_string());

    let model = CuaClient::new(CuaConfig::default())?;
    let instances = ScrapybaraClient::new(ScrapybaraConfig::default())?;

    let (tx, mut rx) = mpsc::unbounded_channel::<LoopEvent>();
    tokio::spawn(async move {
        while let Some(LoopEvent::StreamUrl { stream_url }) = rx.recv().await {
            info!("watch live: {}", stream_url);
        }
    });

    let runs_dir = std::env::temp_dir().join("remote_cua_runs");
    let agent = Agent::new(model, instances, AgentConfig::from_env()?)
        .with_events(Arc::new(tx))
        .with_screenshot_store(Arc::new(DiskScreenshotStore::new(&runs_dir)));

    let mut state = SessionState::new(vec![Turn::human(task)]);
    let report = agent.run(&mut state).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if let Some(id) = &state.instance_id {
        info!(instance_id = %id, screenshots = %runs_dir.display(), "instance left running");
    }
    Ok(())
}
