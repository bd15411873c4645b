// ==========================================
// CRM 导入引擎 - 命令行入口
// ==========================================
// 用法:
//   crm-import <file> --team <team_id> --entity <entity_type>
//              [--db <path>] [--user <user_id>] [--locale <en|zh-CN>] [--log-format pretty|json]
//
// 流程: 解析文件 → 自动映射 → 行匹配 → 关联解析 → 预览 → 执行，最后输出 JSON 汇总
// ==========================================

use clap::{Parser, ValueEnum};
use crm_import::api::ImportApi;
use crm_import::engine::LogNotifier;
use crm_import::{i18n, logging, ApiError};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "crm-import", version, about = "CRM 批量导入: CSV/XLSX → 映射 → 审核 → 提交")]
struct CliArgs {
    /// 待导入文件（.csv / .xlsx / .xls）
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// 团队 id
    #[arg(long = "team", value_name = "TEAM_ID")]
    team_id: String,

    /// 目标实体（companies / people / opportunities / tasks / notes）
    #[arg(long = "entity", value_name = "ENTITY_TYPE")]
    entity_type: String,

    /// 发起导入的用户 id
    #[arg(long = "user", value_name = "USER_ID", default_value = "cli")]
    user_id: String,

    /// 数据库路径（缺省: CRM_IMPORT_DB_PATH 或用户数据目录）
    #[arg(long = "db", value_name = "PATH")]
    db_path: Option<String>,

    /// 消息语言（en / zh-CN），缺省取配置
    #[arg(long = "locale")]
    locale: Option<String>,

    /// 日志输出格式
    #[arg(long = "log-format", value_enum, default_value = "pretty")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    match args.log_format {
        LogFormat::Json => logging::init_json(),
        LogFormat::Pretty => logging::init(),
    }

    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(crm_import::db::default_db_path);
    tracing::info!("{} v{}", crm_import::APP_NAME, crm_import::VERSION);
    tracing::info!("使用数据库: {}", db_path);

    let api = ImportApi::open(&db_path, Arc::new(LogNotifier)).await?;
    i18n::set_locale(args.locale.as_deref().unwrap_or(&api.config().default_locale));

    let filename = args
        .file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let session_id = api
        .create_session(&args.team_id, &args.user_id, &args.entity_type, &filename)
        .await?;

    let mappings = api.load_file(&session_id, &args.file).await?;
    match api.begin_review(&session_id).await {
        Ok(()) => {}
        Err(ApiError::InvalidMapping(issues)) => {
            let summary = serde_json::json!({
                "session_id": session_id,
                "status": "INVALID_MAPPING",
                "mappings": mappings,
                "issues": issues,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            api.cancel(&session_id).await?;
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    }

    api.resolve_matches(&session_id).await?;
    for link in mappings.mapped_links() {
        if let Some(column) = mappings.columns_for_link(&link).first() {
            api.resolve_entity_links(&session_id, &column.source).await?;
        }
    }
    let preview = api.preview(&session_id).await?;

    api.start_execution(&session_id).await?;
    api.wait_for_execution(&session_id).await?;

    let status = api.poll_status(&session_id).await?;
    let failed_rows = api.failed_rows(&session_id).await?;
    let summary = serde_json::json!({
        "session_id": session_id,
        "status": status.status,
        "mappings": mappings,
        "preview": {
            "create": preview.create_count,
            "update": preview.update_count,
            "skip": preview.skip_count,
        },
        "results": status.results,
        "error": status.error,
        "unresolved_links": status.unresolved_links,
        "failed_rows": failed_rows,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if status.error.is_some() {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Result<CliArgs, clap::Error> {
        CliArgs::try_parse_from(std::iter::once("crm-import").chain(raw.iter().copied()))
    }

    #[test]
    fn test_parse_full_args() {
        let parsed = args(&[
            "people.csv", "--team", "t1", "--entity", "people", "--db", "/tmp/x.db", "--log-format", "json",
        ])
        .unwrap();
        assert_eq!(parsed.file, PathBuf::from("people.csv"));
        assert_eq!(parsed.team_id, "t1");
        assert_eq!(parsed.entity_type, "people");
        assert_eq!(parsed.user_id, "cli");
        assert_eq!(parsed.db_path.as_deref(), Some("/tmp/x.db"));
        assert_eq!(parsed.log_format, LogFormat::Json);
    }

    #[test]
    fn test_parse_rejects_missing_and_unknown() {
        assert!(args(&["people.csv", "--entity", "people"]).is_err());
        assert!(args(&["a.csv", "b.csv", "--team", "t", "--entity", "people"]).is_err());
        assert!(args(&["a.csv", "--team", "t", "--entity", "people", "--fast"]).is_err());
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        CliArgs::command().debug_assert();
    }
}
