use std::time::Instant;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

use tutorsched::command::{self, Command};
use tutorsched::config::Config;
use tutorsched::observability;
use tutorsched::registry::CourseRegistry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Results go to stdout, so logs go to stderr.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let config = Config::from_env();
    observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let registry = CourseRegistry::new(config.data_dir.clone(), config.compact_threshold);

    info!("tutorsched ready");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  compact_threshold: {}", config.compact_threshold);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Command>(line) {
            Ok(cmd) => {
                let label = observability::command_label(&cmd);
                let started = Instant::now();
                let result = command::execute(&registry, cmd).await;
                metrics::histogram!(observability::COMMAND_DURATION_SECONDS, "command" => label)
                    .record(started.elapsed().as_secs_f64());
                let status = if result.is_ok() { "ok" } else { "error" };
                metrics::counter!(observability::COMMANDS_TOTAL, "command" => label, "status" => status)
                    .increment(1);
                match result {
                    Ok(value) => json!({ "ok": value }),
                    Err(e) => {
                        tracing::debug!("{label} failed: {e}");
                        json!({ "error": e.to_string() })
                    }
                }
            }
            Err(e) => json!({ "error": format!("bad command: {e}") }),
        };

        stdout.write_all(reply.to_string().as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    info!("tutorsched stopped");
    Ok(())
}
