//! The user-facing web server: one page plus the JSON routes it calls to
//! preview an upload and to run detection on it.

use crate::annotate::Annotator;
use crate::model::Detector;
use crate::pipeline::DetectionRuntimeError;
use crate::torch::ModelInfo;
use crate::upload::ImageDecodeError;
use actix_web::http::header::ContentType;
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use std::sync::Arc;

pub mod protocol;
pub mod routes;

/// Everything a request needs, shared by all workers
pub struct AppState {
    pub model: Arc<dyn Detector>,
    pub annotator: Annotator,
    pub model_info: ModelInfo,
}

#[derive(Debug)]
pub struct WebError {
    err: anyhow::Error,
    status: StatusCode,
    kind: &'static str,
}

impl std::fmt::Display for WebError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#}", self.err)
    }
}

impl actix_web::error::ResponseError for WebError {
    fn error_response(&self) -> HttpResponse {
        let body = serde_json::json!({
            "errors": [self.to_string()],
            "kind": self.kind,
        });

        HttpResponse::build(self.status_code())
            .insert_header(ContentType::json())
            .json(body)
    }

    fn status_code(&self) -> StatusCode {
        self.status
    }
}

impl From<anyhow::Error> for WebError {
    fn from(err: anyhow::Error) -> WebError {
        WebError {
            err,
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
        }
    }
}

impl From<ImageDecodeError> for WebError {
    fn from(err: ImageDecodeError) -> Self {
        WebError {
            err: err.into(),
            status: StatusCode::BAD_REQUEST,
            kind: "image_decode",
        }
    }
}

impl From<base64::DecodeError> for WebError {
    fn from(err: base64::DecodeError) -> Self {
        WebError {
            err: anyhow::Error::new(err).context("upload is not valid base 64"),
            status: StatusCode::BAD_REQUEST,
            kind: "image_decode",
        }
    }
}

impl From<DetectionRuntimeError> for WebError {
    fn from(err: DetectionRuntimeError) -> Self {
        WebError {
            err: err.into(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "detection_runtime",
        }
    }
}
