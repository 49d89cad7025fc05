//! Notify Gate CLI
//!
//! 通知准入控制与分组：从 JSON lines 读取通知请求，限流、分组后投递

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use notify_gate::notification::{DeliveryChannel, JsonlFileChannel, StdoutChannel};
use notify_gate::{
    AdmissionController, DispatchOutcome, GateConfig, GroupingEngine, NotificationDispatcher,
    NotificationRequest,
};
use serde_json::json;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "ngate")]
#[command(about = "Notify Gate - 通知准入控制与分组批量发送")]
#[command(version)]
struct Cli {
    /// 配置文件路径（默认 ~/.config/notify-gate/config.json）
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Dry-run 模式（只打印不发送）
    #[arg(long, global = true)]
    dry_run: bool,
    /// 投递到 JSONL 文件而不是 stdout
    #[arg(long, global = true)]
    output: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 回放 JSON lines 文件，每条请求按自身 created_at 处理
    Replay {
        /// 请求文件
        file: PathBuf,
    },
    /// 从 stdin 持续读取请求，定时释放延迟请求和就绪分组
    Run {
        /// tick 间隔（毫秒）
        #[arg(long, short, default_value = "1000")]
        interval_ms: u64,
    },
    /// 打印生效的配置
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 通过 RUST_LOG 环境变量控制日志级别，默认为 info
    // 例如: RUST_LOG=debug ngate run
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("notify_gate=info,ngate=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    let config = GateConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Replay { file } => {
            let dispatcher = build_dispatcher(&config, cli.dry_run, cli.output.as_deref())?;
            replay(&dispatcher, &file)?;
        }
        Commands::Run { interval_ms } => {
            let dispatcher = build_dispatcher(&config, cli.dry_run, cli.output.as_deref())?;
            run(dispatcher, interval_ms).await?;
        }
    }

    Ok(())
}

fn build_dispatcher(
    config: &GateConfig,
    dry_run: bool,
    output: Option<&Path>,
) -> Result<NotificationDispatcher> {
    let admission = Arc::new(AdmissionController::new(config.throttle.clone())?);
    let grouping = Arc::new(GroupingEngine::new(config.grouping.clone())?);

    let channel: Arc<dyn DeliveryChannel> = match output {
        Some(path) => Arc::new(JsonlFileChannel::new(path)),
        None => Arc::new(StdoutChannel::new()),
    };

    let mut dispatcher = NotificationDispatcher::new(admission, grouping).with_dry_run(dry_run);
    dispatcher.register_channel(channel);
    Ok(dispatcher)
}

fn parse_line(line: &str, line_no: usize) -> Option<NotificationRequest> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    match serde_json::from_str::<NotificationRequest>(trimmed) {
        Ok(request) => Some(request),
        Err(e) => {
            warn!(line = line_no, error = %e, "Skipping malformed request");
            None
        }
    }
}

/// Outcome tally for the final report
#[derive(Default)]
struct Tally {
    sent: usize,
    grouped: usize,
    escalated: usize,
    delayed: usize,
    blocked: usize,
}

impl Tally {
    fn record(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Sent(_) => self.sent += 1,
            DispatchOutcome::Grouped { .. } => self.grouped += 1,
            DispatchOutcome::Escalated { .. } => self.escalated += 1,
            DispatchOutcome::Delayed { .. } => self.delayed += 1,
            DispatchOutcome::Blocked { .. } => self.blocked += 1,
        }
    }
}

fn replay(dispatcher: &NotificationDispatcher, file: &Path) -> Result<()> {
    let reader = BufReader::new(
        File::open(file).with_context(|| format!("failed to open {}", file.display()))?,
    );
    let mut tally = Tally::default();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let Some(request) = parse_line(&line, idx + 1) else {
            continue;
        };
        let now = request.created_at;
        // 先释放到期的延迟请求和就绪分组，再处理当前请求
        dispatcher.tick_at(now);
        let outcome = dispatcher.submit_at(request, now);
        debug!(line = idx + 1, outcome = ?outcome, "Replayed request");
        tally.record(&outcome);
    }

    let flushed = dispatcher.flush_all();
    let report = json!({
        "outcomes": {
            "sent": tally.sent,
            "grouped": tally.grouped,
            "escalated": tally.escalated,
            "delayed": tally.delayed,
            "blocked": tally.blocked,
        },
        "flushed_groups": flushed.sent_groups,
        "released_delayed": flushed.released,
        "dropped_delayed": flushed.dropped,
        "admission": dispatcher.admission().stats(),
        "grouping": dispatcher.grouping().stats(),
    });
    eprintln!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run(dispatcher: NotificationDispatcher, interval_ms: u64) -> Result<()> {
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::time::{interval, Duration, MissedTickBehavior};

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = interval(Duration::from_millis(interval_ms.max(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut line_no = 0usize;

    info!(interval_ms, "Reading requests from stdin");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        line_no += 1;
                        if let Some(request) = parse_line(&line, line_no) {
                            let outcome = dispatcher.submit(request);
                            debug!(line = line_no, outcome = ?outcome, "Request processed");
                        }
                    }
                    None => {
                        info!("stdin closed");
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                dispatcher.tick();
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    dispatcher.flush_all();
    let stats = json!({
        "admission": dispatcher.admission().stats(),
        "grouping": dispatcher.grouping().stats(),
    });
    eprintln!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
