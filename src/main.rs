use anyhow::{Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use deepresearch_rs::cli::Args;
use deepresearch_rs::launch;
use deepresearch_rs::memory::{FileRunStateStore, RunStateStore};

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);
    let config = args.into_config()?;

    if args.list_runs || args.discard_run.is_some() {
        let Some(dir) = &config.checkpoint.checkpoint_dir else {
            bail!("未配置检查点目录，无法管理运行记录（使用 --checkpoint-dir 或 CHECKPOINT_DIR）");
        };
        let store = FileRunStateStore::new(dir.clone());

        if let Some(run_id) = &args.discard_run {
            if store.discard(run_id).await? {
                println!("🗑️ 已删除运行 {}", run_id);
            } else {
                println!("运行 {} 不存在", run_id);
            }
        }
        if args.list_runs {
            let runs = store.list().await?;
            if runs.is_empty() {
                println!("没有已保存的运行");
            }
            for run_id in runs {
                let state = store.load(&run_id).await?;
                println!(
                    "{}\t{:?}\t第{}轮\t{}",
                    run_id, state.run.status, state.run.round, state.run.query
                );
            }
        }
        return Ok(());
    }

    let Some(request) = args.run_request() else {
        bail!("请提供研究问题，例如: deepresearch-rs \"量子纠错的最新进展是什么？\"");
    };

    let report = launch(&config, &request).await?;
    println!("{}", report.report);
    Ok(())
}
