//! `warren-ctl submit`: send jobs to the broker and print their results.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use warren_core::config::WarrenConfig;
use warren_services::client::format_result;
use warren_services::Client;

pub struct SubmitArgs {
    pub id: Option<String>,
    pub broker: Option<String>,
    pub func: String,
    pub data: Option<String>,
    pub file: Option<PathBuf>,
    pub cores: u32,
    pub count: u32,
}

pub async fn cmd_submit(mut config: WarrenConfig, args: SubmitArgs) -> Result<()> {
    if let Some(id) = args.id {
        config.client.id = id;
    }
    if let Some(broker) = args.broker {
        config.client.broker = broker;
    }

    let data = match (args.data, args.file) {
        (Some(data), None) => data,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => bail!("one of --data or --file is required"),
        (Some(_), Some(_)) => bail!("--data and --file are mutually exclusive"),
    };
    serde_json::from_str::<serde_json::Value>(&data).context("job data is not valid JSON")?;

    let client = Client::connect(&config.client, config.transport.clone())
        .await
        .with_context(|| format!("failed to reach broker at {}", config.client.broker))?;

    let mut outstanding = HashSet::new();
    for _ in 0..args.count.max(1) {
        let task_id = client.submit(&args.func, data.clone(), args.cores).await?;
        println!("submitted {task_id}");
        outstanding.insert(task_id);
    }

    let outcome = {
        let mut results = Box::pin(client.results());
        loop {
            if outstanding.is_empty() {
                break Ok(());
            }
            let Some(next) = results.next().await else {
                break Ok(());
            };
            match next {
                Ok(result) => {
                    if !outstanding.remove(&result.id) {
                        continue;
                    }
                    println!("═══════════════════════════════════════");
                    println!("  Task {}", result.id);
                    println!("═══════════════════════════════════════");
                    println!("{}", format_result(&result.data));
                }
                Err(e) => break Err(anyhow::Error::new(e).context("lost connection to broker")),
            }
        }
    };

    client.close().await;
    outcome
}
