//! PACS导入程序主程序

use anyhow::{bail, Context, Result};
use clap::Parser;
use pacs_admin::{init_logging, ConfigManager, ConfigOverrides};
use pacs_core::JobStatus;
use pacs_database::{DatabaseOptions, DatabasePool};
use pacs_workflow::{ImportEvent, ImportOptions, ImportOrchestrator};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// PACS导入程序命令行参数
#[derive(Parser, Debug)]
#[command(name = "pacs-server")]
#[command(about = "DICOM 批量导入：解析文件并写入 患者/检查/序列/图像 索引库")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 索引库文件
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// 每批文件数 (1-1000)
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// 提取线程数，0 表示使用可用并行度
    #[arg(short, long)]
    workers: Option<usize>,

    /// 日志级别
    #[arg(short, long)]
    log_level: Option<String>,

    /// 输出生效配置后退出
    #[arg(long)]
    print_config: bool,

    /// 要导入的文件或目录，目录会被递归展开
    #[arg(required_unless_present = "print_config")]
    paths: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut manager = ConfigManager::new(args.config.as_deref())?;
    manager.apply_overrides(ConfigOverrides {
        database_path: args.database,
        batch_size: args.batch_size,
        worker_threads: args.workers,
        log_level: args.log_level,
    })?;

    if args.print_config {
        print!("{}", manager.to_toml()?);
        return Ok(());
    }

    let config = manager.config().clone();
    init_logging(&config.logging)?;

    let paths = collect_paths(&args.paths);
    info!("启动导入: {} 个候选文件", paths.len());
    info!("  索引库: {:?}", config.database.path);
    info!("  批次大小: {}", config.import.batch_size);

    let database = DatabasePool::open(&DatabaseOptions {
        path: config.database.path.clone(),
        max_connections: config.database.max_connections,
        busy_timeout: Duration::from_millis(config.database.busy_timeout_ms),
    })
    .await
    .with_context(|| format!("无法打开索引库 {:?}", config.database.path))?;

    let (orchestrator, mut events) = ImportOrchestrator::new(
        database.clone(),
        ImportOptions {
            batch_size: config.import.batch_size,
            worker_threads: config.import.worker_threads,
        },
    );

    let reporter = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    let handle = orchestrator.submit(paths)?;
    let job = handle.wait().await;

    // 关闭事件通道，等待剩余事件输出完毕
    drop(orchestrator);
    if let Err(e) = reporter.await {
        warn!("事件输出任务异常结束: {}", e);
    }
    database.close().await;

    let job = job?;
    match job.status {
        JobStatus::Completed => {
            info!(
                "导入完成: {} 个图像, {} 个文件跳过",
                job.images_indexed, job.files_skipped
            );
            Ok(())
        }
        status => {
            let reason = job.error.unwrap_or_else(|| format!("{:?}", status));
            if let Some(index) = job.first_unprocessed {
                error!("第一个未提交的文件下标: {}", index);
            }
            bail!("导入失败: {}", reason)
        }
    }
}

/// 展开输入路径，目录按文件名排序递归遍历
fn collect_paths(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for input in inputs {
        if !input.is_dir() {
            paths.push(input.clone());
            continue;
        }

        for entry in WalkDir::new(input).sort_by_file_name() {
            match entry {
                Ok(entry) if entry.file_type().is_file() => paths.push(entry.into_path()),
                Ok(_) => {}
                Err(e) => warn!("无法遍历目录 {:?}: {}", input, e),
            }
        }
    }
    paths
}

fn log_event(event: &ImportEvent) {
    match event {
        ImportEvent::Job(job) => info!(
            "[{:?}] {:>3}% {}",
            job.status, job.progress, job.details
        ),
        ImportEvent::DataChanged {
            study_uids,
            series_uids,
            ..
        } => debug!(
            "索引已更新: {} 个检查, {} 个序列",
            study_uids.len(),
            series_uids.len()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_paths_expands_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("siteA").join("exam1");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("b.dcm"), b"x").unwrap();
        std::fs::write(nested.join("a.dcm"), b"x").unwrap();
        let single = dir.path().join("single.dcm");
        std::fs::write(&single, b"x").unwrap();

        let paths = collect_paths(&[dir.path().join("siteA"), single.clone()]);
        assert_eq!(
            paths,
            vec![nested.join("a.dcm"), nested.join("b.dcm"), single]
        );
    }

    #[test]
    fn test_args_require_paths() {
        assert!(Args::try_parse_from(["pacs-server"]).is_err());
        let args = Args::try_parse_from(["pacs-server", "--print-config"]).unwrap();
        assert!(args.print_config);
        let args =
            Args::try_parse_from(["pacs-server", "-b", "50", "/data/scans"]).unwrap();
        assert_eq!(args.batch_size, Some(50));
        assert_eq!(args.paths, vec![PathBuf::from("/data/scans")]);
    }
}
