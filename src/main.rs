use mediasync_lib::logging::{get_log_dir, LogConfig, SizeRotatingWriter};
use mediasync_lib::{AppState, SyncEvent};
use tracing_subscriber::prelude::*;

/// 初始化日志系统
fn init_logging() {
    let log_dir = get_log_dir();
    let _ = std::fs::create_dir_all(&log_dir);

    let config = LogConfig::load(&log_dir);

    if !config.enabled {
        // 日志已禁用，只初始化一个空的 subscriber
        let subscriber = tracing_subscriber::registry();
        let _ = tracing::subscriber::set_global_default(subscriber);
        return;
    }

    // 创建日志级别过滤器
    let level = config.tracing_level();
    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("reqwest=warn".parse().unwrap())
        .add_directive("notify=warn".parse().unwrap());

    // 创建文件日志写入器
    if let Ok(file_writer) = SizeRotatingWriter::new(&log_dir, config.max_size_mb) {
        // 文件日志层 - 始终输出到文件
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false);

        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer);

        let _ = tracing::subscriber::set_global_default(subscriber);
    } else {
        // 文件日志创建失败，回退到控制台
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统
    init_logging();

    let state = AppState::new()?;

    // 无 token 时尝试用环境变量里的凭据登录
    if state.settings.auth_token().is_none() {
        match (
            std::env::var("MEDIASYNC_USERNAME"),
            std::env::var("MEDIASYNC_PASSWORD"),
        ) {
            (Ok(username), Ok(password)) => {
                if let Err(e) = state.login(&username, &password).await {
                    tracing::error!("登录失败: {}", e);
                    return Err(e.into());
                }
            }
            _ => {
                tracing::warn!(
                    "未配置认证 token，也未提供 MEDIASYNC_USERNAME/MEDIASYNC_PASSWORD，上传请求将不带认证头"
                );
            }
        }
    }

    let controller = state.controller.clone();
    let mut events = controller.take_events().expect("事件通道只取一次");

    // 把引擎事件写入日志，替代 GUI 的状态展示
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SyncEvent::SyncProgress { percent } => {
                    tracing::debug!("总进度: {}%", percent);
                }
                SyncEvent::ItemStatusChanged { path, status } => {
                    tracing::info!("[{}] {}", status, path);
                }
                SyncEvent::ItemProgress { path, percent } => {
                    tracing::debug!("[{}%] {}", percent, path);
                }
                SyncEvent::SyncError { message } => {
                    tracing::error!("{}", message);
                }
                other => {
                    tracing::info!("{:?}", other);
                }
            }
        }
    });

    state.controller.start().await;

    // 命令行传入的文件夹加入监控
    for arg in std::env::args().skip(1) {
        let path = std::path::PathBuf::from(&arg);
        if let Err(e) = state.controller.add_folder(&path).await {
            tracing::error!("添加文件夹失败: {} - {}", arg, e);
        }
    }

    tracing::info!("mediasync 已启动，Ctrl-C 退出");
    tokio::signal::ctrl_c().await?;

    state.cleanup().await;
    Ok(())
}
