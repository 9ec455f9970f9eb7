//! 电源策略守护进程
//!
//! 从标准输入读取控制命令，直到输入结束或收到关闭信号。

use anyhow::{Context as _, Result};
use policy_engine::command::Command;
use policy_engine::{FileStore, LogExtension, PolicyContext, ThresholdExtension};
use policy_shared::config::AppConfig;
use policy_shared::observability;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // 统一加载配置：从 config/{service_name}.toml 加载，包含可观测性配置
    let config = AppConfig::load("policyd").unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });

    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config)?;

    info!(
        environment = %config.environment,
        production = config.is_production(),
        "Starting policyd..."
    );

    let store = FileStore::open(&config.policy.store_path).with_context(|| {
        format!(
            "Failed to open policy store {}",
            config.policy.store_path.display()
        )
    })?;
    info!(path = %store.path().display(), "Policy store opened");

    let mut ctx = PolicyContext::new(Arc::new(store));
    ctx.load_extension(&LogExtension)?;
    ctx.load_extension(&ThresholdExtension::from_declarations(&config.policy.events)?)?;

    bootstrap(&mut ctx, &config).await;

    let report = ctx.reload()?;
    info!(
        rules = report.rules_added.len(),
        failures = report.failures.len(),
        "Policy loaded"
    );

    run_command_loop(&mut ctx).await?;

    info!("Service shutdown complete");
    Ok(())
}

/// 存储中没有规则时，从配置的策略文本文件初始化
async fn bootstrap(ctx: &mut PolicyContext, config: &AppConfig) {
    let Some(path) = &config.policy.rules_file else {
        return;
    };
    if ctx.store_has_rules() {
        info!("Store already has rules, skipping bootstrap file");
        return;
    }

    match tokio::fs::read_to_string(path).await {
        Ok(text) => {
            let report = ctx.load_policy_text(&text);
            info!(
                path = %path.display(),
                rules = report.rules_added.len(),
                variables = report.variables_defined.len(),
                failures = report.failures.len(),
                "Bootstrapped policy from file"
            );
        }
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to read rules file"),
    }
}

async fn run_command_loop(ctx: &mut PolicyContext) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("Input closed");
                    break;
                };

                let output = match Command::parse(&line) {
                    Ok(None) => continue,
                    Ok(Some(command)) => command.execute(ctx).unwrap_or_else(|e| {
                        error!(command = %line.trim(), error = %e, "Command failed");
                        format!("错误: {:#}", e)
                    }),
                    Err(e) => format!("错误: {:#}", e),
                };

                stdout.write_all(output.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
        }
    }
    Ok(())
}

/// 优雅关闭信号处理
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
