//! Routes of the single-page front end. Each request is one render cycle:
//! nothing is kept between requests.

use super::protocol::{B64Image, DetectResponse, Upload};
use super::{AppState, WebError};
use crate::config::NO_DETECTIONS_MESSAGE;
use crate::pipeline::{self, DetectionRuntimeError};
use crate::upload;
use actix_web::http::header::ContentType;
use actix_web::{get, post, web, HttpResponse, Responder};
use tracing::*;

type Result<T> = std::result::Result<T, WebError>;

const INDEX_HTML: &str = include_str!("../../assets/index.html");

/// Register every route on an app
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(index)
        .service(preview)
        .service(detect)
        .service(model_info);
}

/// The page
#[get("/")]
pub async fn index() -> impl Responder {
    HttpResponse::Ok()
        .content_type(ContentType::html())
        .body(INDEX_HTML)
}

/// Decode an upload and send it back as a PNG preview
#[post("/preview")]
pub async fn preview(req: web::Json<Upload>) -> Result<impl Responder> {
    let raw = req.bytes()?;
    let image = upload::decode_named(req.filename.as_deref(), &raw).map_err(|e| {
        warn!("rejected upload {:?}: {e}", req.filename);
        e
    })?;

    Ok(web::Json(B64Image::png(&image.pixels)?))
}

/// Run the detection pipeline over an upload
#[post("/detect")]
pub async fn detect(req: web::Json<Upload>, state: web::Data<AppState>) -> Result<impl Responder> {
    let raw = req.bytes()?;
    let image = upload::decode_named(req.filename.as_deref(), &raw)?;
    info!(
        "detection requested for {:?} ({}x{})",
        req.filename,
        image.width(),
        image.height()
    );

    // Inference is blocking work; keep it off the async workers
    let worker_state = state.clone();
    let outcome = web::block(move || {
        pipeline::detect(worker_state.model.as_ref(), &worker_state.annotator, &image)
    })
    .await
    .map_err(|e| DetectionRuntimeError::Panicked(e.to_string()))?
    .map_err(|e| {
        error!("detection failed: {e}");
        e
    })?;

    Ok(web::Json(DetectResponse::from_outcome(
        outcome,
        NO_DETECTIONS_MESSAGE,
    )?))
}

/// Facts about the loaded model
#[get("/model")]
pub async fn model_info(state: web::Data<AppState>) -> impl Responder {
    web::Json(state.model_info.clone())
}
