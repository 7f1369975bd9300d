/*
 * Harvest - Scheduled Data Collection and Reconciliation Service
 * Copyright (c) 2024 Harvest Project
 *
 * This work is licensed under CC BY-NC-SA 4.0
 * https://creativecommons.org/licenses/by-nc-sa/4.0/
 */

use std::{sync::Arc, time::Duration};

use axum::{Router, http::Method, response::Json, routing::get};
use harvest_backend::{
    config::Config,
    context::AppContext,
    database::{Database, mask_database_url},
    docs::ApiDoc,
    error::AppResult,
    handlers::{AppState, health_check},
    routes::create_api_routes,
    services::{CollectorRegistry, Executor, HealthMonitor, HttpProber},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;

#[tokio::main]
async fn main() -> AppResult<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "harvest_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 加载配置
    let config = match Config::from_file("config.toml") {
        Ok(config) => {
            tracing::info!("已加载配置文件: config.toml");
            config
        }
        Err(_) => {
            tracing::warn!("未找到配置文件，使用默认配置");
            let default_config = Config::default();
            if let Err(e) = default_config.save_to_file("config.toml") {
                tracing::warn!("保存默认配置失败: {}", e);
            }
            default_config
        }
    };
    config.validate()?;

    tracing::info!("服务器配置: {}", config.server_addr());

    // 初始化存储（数据库不可用时退回内存存储，仅适合开发调试）
    let ctx = match Database::new(&config.database).await {
        Ok(db) => {
            match db.missing_tables().await {
                Ok(missing) if !missing.is_empty() => {
                    tracing::warn!("数据库缺少表: {:?}，请先执行 sql/schema.sql", missing);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("数据库结构检查失败: {}", e),
            }
            AppContext::postgres(db, config.clone())
        }
        Err(e) => {
            tracing::warn!(
                "数据库连接失败（{}），服务将使用内存存储启动: {}",
                mask_database_url(&config.database.url),
                e
            );
            AppContext::in_memory(config.clone())
        }
    };

    // 采集器注册表
    let registry = Arc::new(CollectorRegistry::from_config(&config.collectors)?);

    // 启动执行器工作线程
    let executor = Arc::new(Executor::new(ctx.clone(), registry));
    let _workers = executor.spawn_workers();

    // 健康监测
    let prober = Arc::new(HttpProber::new(Duration::from_secs(
        config.health.timeout_secs,
    ))?);
    let health = HealthMonitor::new(ctx.clone(), prober);
    let app_state = AppState::new(ctx.clone(), health.clone());

    if config.health.enabled {
        tokio::spawn(health.start());
    } else {
        tracing::info!("周期健康监测已禁用");
    }

    // 调度器
    if config.scheduler.enabled {
        tokio::spawn(app_state.scheduler.clone().start());
    } else {
        tracing::info!("周期调度已禁用，仅支持手动触发");
    }

    // 僵死状态清扫
    tokio::spawn(app_state.tracker.clone().start_sweeper());

    // 创建CORS中间件
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(vec![Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_check))
        // OpenAPI JSON 路由
        .route(
            "/api-docs/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        // 业务API路由
        .merge(create_api_routes())
        .with_state(app_state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // 启动服务器
    let listener = tokio::net::TcpListener::bind(&config.server_addr()).await?;
    tracing::info!("🚀 服务器启动成功，监听地址: {}", config.server_addr());

    axum::serve(listener, app).await?;

    if let Some(db) = &ctx.database {
        db.close().await;
    }

    Ok(())
}
