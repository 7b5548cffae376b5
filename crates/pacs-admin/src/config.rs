//! 配置管理
//!
//! 按 内置默认值 → TOML 配置文件 → `PACS_` 环境变量 的顺序合并配置，
//! 合并结果经过 `ConfigValidator` 校验后使用。

use crate::logging::LogFormat;
use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// 配置管理器
#[derive(Debug)]
pub struct ConfigManager {
    /// 配置数据
    config: PacsConfig,
    /// 配置文件路径
    config_path: Option<PathBuf>,
    /// 配置验证器
    validator: ConfigValidator,
}

/// 导入系统完整配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacsConfig {
    /// 索引库配置
    pub database: DatabaseConfig,
    /// 导入配置
    pub import: ImportConfig,
    /// 日志配置
    pub logging: LoggingConfig,
}

/// 索引库配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite 文件路径
    pub path: PathBuf,
    /// 最大连接数
    pub max_connections: u32,
    /// busy_timeout（毫秒）
    pub busy_timeout_ms: u64,
}

/// 导入配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// 每批文件数
    pub batch_size: usize,
    /// 提取线程数，0 表示使用可用并行度
    pub worker_threads: usize,
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别或 EnvFilter 指令
    pub level: String,
    /// 日志格式: full / compact / pretty
    pub format: String,
}

/// 命令行覆盖项
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub database_path: Option<PathBuf>,
    pub batch_size: Option<usize>,
    pub worker_threads: Option<usize>,
    pub log_level: Option<String>,
}

impl ConfigManager {
    /// 创建新的配置管理器
    ///
    /// 指定的配置文件必须存在；未指定时只使用默认值和环境变量。
    pub fn new(config_path: Option<&Path>) -> Result<Self> {
        let config = Self::load_config(config_path)?;
        let validator = ConfigValidator::new();
        validator.validate(&config)?;

        Ok(Self {
            config,
            config_path: config_path.map(Path::to_path_buf),
            validator,
        })
    }

    /// 加载配置
    fn load_config(config_path: Option<&Path>) -> Result<PacsConfig> {
        let mut builder = Config::builder().add_source(
            Config::try_from(&PacsConfig::default()).context("Failed to build default configuration")?,
        );

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                Environment::with_prefix("PACS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?;

        let config: PacsConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        match config_path {
            Some(path) => info!("Configuration loaded from: {:?}", path),
            None => debug!("Configuration loaded from defaults and environment"),
        }
        Ok(config)
    }

    /// 获取配置
    pub fn config(&self) -> &PacsConfig {
        &self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// 应用命令行覆盖项并重新校验
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) -> Result<()> {
        let mut config = self.config.clone();
        if let Some(path) = overrides.database_path {
            config.database.path = path;
        }
        if let Some(batch_size) = overrides.batch_size {
            config.import.batch_size = batch_size;
        }
        if let Some(worker_threads) = overrides.worker_threads {
            config.import.worker_threads = worker_threads;
        }
        if let Some(level) = overrides.log_level {
            config.logging.level = level;
        }

        self.validator.validate(&config)?;
        self.config = config;
        Ok(())
    }

    /// 生效配置的 TOML 文本
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(&self.config).context("Failed to serialize configuration")
    }

    /// 保存配置到文件
    pub async fn save_config(&self, path: &Path) -> Result<()> {
        let config_str = self.to_toml()?;
        tokio::fs::write(path, config_str)
            .await
            .context("Failed to write configuration file")?;

        info!("Configuration saved to: {:?}", path);
        Ok(())
    }
}

/// 配置验证器
#[derive(Debug)]
pub struct ConfigValidator {
    /// 验证规则
    validation_rules: Vec<ValidationRule>,
}

/// 验证规则
#[derive(Debug)]
struct ValidationRule {
    /// 字段路径
    field_path: String,
    /// 验证函数
    validator: fn(&PacsConfig) -> Result<()>,
    /// 错误消息
    error_message: String,
}

impl ConfigValidator {
    /// 创建新的配置验证器
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "database.max_connections".to_string(),
                validator: |config| {
                    if config.database.max_connections == 0 {
                        Err(anyhow::anyhow!("Database max connections cannot be 0"))
                    } else {
                        Ok(())
                    }
                },
                error_message: "Invalid database max connections".to_string(),
            },
            ValidationRule {
                field_path: "database.busy_timeout_ms".to_string(),
                validator: |config| {
                    if config.database.busy_timeout_ms == 0 {
                        Err(anyhow::anyhow!("Busy timeout cannot be 0"))
                    } else {
                        Ok(())
                    }
                },
                error_message: "Invalid database busy timeout".to_string(),
            },
            ValidationRule {
                field_path: "import.batch_size".to_string(),
                validator: |config| {
                    if (1..=1000).contains(&config.import.batch_size) {
                        Ok(())
                    } else {
                        Err(anyhow::anyhow!(
                            "Batch size {} is outside 1..=1000",
                            config.import.batch_size
                        ))
                    }
                },
                error_message: "Invalid import batch size".to_string(),
            },
            ValidationRule {
                field_path: "logging.format".to_string(),
                validator: |config| config.logging.format.parse::<LogFormat>().map(|_| ()),
                error_message: "Invalid log format".to_string(),
            },
            ValidationRule {
                field_path: "logging.level".to_string(),
                validator: |config| {
                    EnvFilter::try_new(&config.logging.level)
                        .map(|_| ())
                        .map_err(|e| anyhow::anyhow!("{}", e))
                },
                error_message: "Invalid log level".to_string(),
            },
        ];

        Self { validation_rules }
    }

    /// 验证配置
    pub fn validate(&self, config: &PacsConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if let Err(e) = (rule.validator)(config) {
                error!("Configuration validation failed for {}: {}", rule.field_path, e);
                return Err(anyhow::anyhow!("{}: {}", rule.error_message, e));
            }
        }

        debug!("Configuration validation passed");
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/pacs-index.db"),
            max_connections: 4,
            busy_timeout_ms: 5000,
        }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            worker_threads: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "full".to_string(),
        }
    }
}
