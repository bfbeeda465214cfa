use std::process::ExitCode;

use serde_json::json;

use adaptive_practice_engine::config::Config;
use adaptive_practice_engine::db::Store;
use adaptive_practice_engine::engine::{Difficulty, PredictionEngine};
use adaptive_practice_engine::logging::init_tracing;
use adaptive_practice_engine::workers::WorkerManager;

const USAGE: &str = "usage: adaptive-practice-engine <command>

commands:
  train                                  retrain every topic now
  stats <topic>                          show item parameters and counts for a topic
  predict <user> <topic> <difficulty>    predict correctness and time
  serve-workers                          run the scheduled retrain worker until interrupted";

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();
    let _log_guard = init_tracing(&config.log_level);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{USAGE}");
        return ExitCode::FAILURE;
    };

    let store = match Store::connect(&config.database_url).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, database_url = %config.database_url, "failed to open database");
            return ExitCode::FAILURE;
        }
    };
    let engine = match PredictionEngine::load(store.clone(), config.engine.clone()).await {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(error = %e, "failed to load prediction engine");
            return ExitCode::FAILURE;
        }
    };

    let code = match (command, &args[1..]) {
        ("train", []) => match engine.force_train().await {
            Ok(report) => print_json(&json!(report)),
            Err(e) => {
                tracing::error!(error = %e, "training failed");
                ExitCode::FAILURE
            }
        },
        ("stats", [topic]) => {
            let tracker = engine.tracker_state().await.ok();
            let phase = engine.trigger_phase().await.ok();
            print_json(&json!({
                "model": engine.get_model_stats(topic),
                "tracker": tracker,
                "phase": phase,
            }))
        }
        ("predict", [user, topic, difficulty]) => {
            let Some(difficulty) = Difficulty::parse(difficulty) else {
                eprintln!("unknown difficulty: {difficulty}");
                return ExitCode::FAILURE;
            };
            let detail = engine.predict_detailed(user, topic, difficulty).await;
            let params = engine.get_user_parameters(user, topic);
            print_json(&json!({
                "probability": detail.prediction.probability,
                "seconds": detail.prediction.seconds,
                "source": detail.source,
                "regime": detail.regime,
                "theta": params.theta,
                "tau": params.tau,
                "is_personalized": params.is_personalized,
            }))
        }
        ("serve-workers", []) => serve_workers(engine).await,
        _ => {
            eprintln!("{USAGE}");
            ExitCode::FAILURE
        }
    };

    store.close().await;
    code
}

fn print_json(value: &serde_json::Value) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{text}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to render output");
            ExitCode::FAILURE
        }
    }
}

async fn serve_workers(engine: PredictionEngine) -> ExitCode {
    let manager = match WorkerManager::new(engine).await {
        Ok(manager) => manager,
        Err(e) => {
            tracing::error!(error = %e, "worker manager not initialized");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = manager.start().await {
        tracing::error!(error = %e, "failed to start workers");
        return ExitCode::FAILURE;
    }

    shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping workers");
    manager.stop().await;
    tracing::info!("Graceful shutdown complete");
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
