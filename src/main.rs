pub mod config;
pub mod inference;
pub mod models;

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::middleware::{DefaultHeaders, Logger};
use actix_web::{get, post, web, App, HttpResponse, HttpServer, Responder};
use log::{error, info};
use serde_json::json;

use config::ServerConfig;
use inference::SignModel;
use models::{ErrorBody, PredictRequest};

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

#[get("/model-info")]
async fn model_info(model: web::Data<Arc<SignModel>>) -> impl Responder {
    HttpResponse::Ok().json(model.info())
}

#[post("/predict")]
async fn predict(
    model: web::Data<Arc<SignModel>>,
    req: web::Json<PredictRequest>,
) -> impl Responder {
    let frames = match models::parse_sequence(&req.sequence) {
        Ok(frames) => frames,
        Err(e) => return HttpResponse::Ok().json(ErrorBody::new(e)),
    };

    // the client always gets a 200 with either a prediction or an {error} body
    let model = model.get_ref().clone();
    match web::block(move || model.predict(&frames)).await {
        Ok(Ok(prediction)) => {
            info!(
                "prediction: label={} confidence={:.3}",
                prediction.label, prediction.confidence
            );
            HttpResponse::Ok().json(prediction)
        }
        Ok(Err(e)) => {
            error!("inference failed: {}", e);
            HttpResponse::Ok().json(ErrorBody::new(format!("prediction failed: {}", e)))
        }
        Err(e) => {
            error!("blocking task failed: {}", e);
            HttpResponse::Ok().json(ErrorBody::new("prediction failed: worker error"))
        }
    }
}

async fn not_found() -> impl Responder {
    HttpResponse::NotFound().json(ErrorBody::new("endpoint not found"))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .format_module_path(false)
        .init();

    let config = ServerConfig::from_env();

    let model = match SignModel::load(&config.model_path) {
        Ok(model) => {
            info!(
                "model loaded from {} ({} classes)",
                config.model_path,
                model.num_classes()
            );
            Arc::new(model)
        }
        Err(e) => {
            error!("failed to load model: {:#}", e);
            panic!("cannot start without a model: {}", e);
        }
    };

    let model_data = web::Data::new(model);
    let bind_address = config.bind_address();

    info!("starting server on http://{}", bind_address);
    info!("workers: {}", config.workers);
    info!("allowed origin: {}", config.allowed_origin);
    info!("endpoints:");
    info!("  GET  /health");
    info!("  GET  /model-info");
    info!("  POST /predict");

    let allowed_origin = config.allowed_origin.clone();
    HttpServer::new(move || {
        let cors = Cors::default()
            .allowed_origin(&allowed_origin)
            .allowed_methods(vec!["GET", "POST"])
            .allowed_headers(vec![actix_web::http::header::CONTENT_TYPE])
            .supports_credentials()
            .max_age(3600);

        App::new()
            .wrap(Logger::default())
            .wrap(DefaultHeaders::new().add(("X-Content-Type-Options", "nosniff")))
            .wrap(cors)
            .app_data(model_data.clone())
            .app_data(web::JsonConfig::default().limit(10 * 1024 * 1024))
            .service(health)
            .service(model_info)
            .service(predict)
            .default_service(web::route().to(not_found))
    })
    .workers(config.workers)
    .bind(&bind_address)?
    .run()
    .await
}
