//! # Prediction Service
//!
//! The serving boundary: a loaded bundle shared behind an `Arc`, JSON in and
//! JSON out. A bundle that fails to load leaves the service in a degraded
//! state in which every request is answered with status 503 and the load
//! error, instead of a guessed probability.

use crate::artifact::{ModelBundle, PipelineError};
use crate::request::{BorrowerRequest, FieldViolation, ValidationError, parse_request};
use crate::schema::FeatureMatrix;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub probability_of_default: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: u16,
    pub error: String,
    pub message: String,
    pub fields: Vec<FieldViolation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Model is unavailable: {reason}")]
    ModelUnavailable { reason: String },
    #[error("Prediction failed: {0}")]
    Computation(#[from] PipelineError),
}

impl ServiceError {
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation(_) => 422,
            Self::ModelUnavailable { .. } => 503,
            Self::Computation(_) => 500,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::ModelUnavailable { .. } => "model_unavailable",
            Self::Computation(_) => "computation_error",
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        let fields = match self {
            Self::Validation(e) => e.fields().to_vec(),
            _ => Vec::new(),
        };
        ErrorResponse {
            status: self.status(),
            error: self.kind().to_string(),
            message: self.to_string(),
            fields,
        }
    }
}

/// Rounds a probability to two decimals for the response.
pub fn round_probability(p: f64) -> f64 {
    (p * 100.0).round() / 100.0
}

#[derive(Debug, Clone)]
pub enum ServiceHandle {
    Ready(Arc<ModelBundle>),
    Unavailable { reason: String },
}

impl ServiceHandle {
    /// Loads the bundle in `dir`. Failure is not an error here: the handle
    /// comes up degraded and reports the cause on every request.
    pub fn load(dir: &Path) -> Self {
        match ModelBundle::load(dir) {
            Ok(bundle) => Self::Ready(Arc::new(bundle)),
            Err(e) => {
                log::error!("Model bundle at {} could not be loaded: {e}", dir.display());
                Self::Unavailable {
                    reason: e.to_string(),
                }
            }
        }
    }

    pub fn from_bundle(bundle: ModelBundle) -> Self {
        Self::Ready(Arc::new(bundle))
    }

    pub fn health(&self) -> HealthStatus {
        match self {
            Self::Ready(bundle) => HealthStatus {
                status: "ok".to_string(),
                model_version: Some(bundle.manifest.model_version.clone()),
                reason: None,
            },
            Self::Unavailable { reason } => HealthStatus {
                status: "unavailable".to_string(),
                model_version: None,
                reason: Some(reason.clone()),
            },
        }
    }

    fn bundle(&self) -> Result<&ModelBundle, ServiceError> {
        match self {
            Self::Ready(bundle) => Ok(bundle),
            Self::Unavailable { reason } => Err(ServiceError::ModelUnavailable {
                reason: reason.clone(),
            }),
        }
    }

    /// Scores one already typed request.
    pub fn predict(&self, request: &BorrowerRequest) -> Result<PredictionResponse, ServiceError> {
        let bundle = self.bundle()?;
        request.validate()?;
        let raw = FeatureMatrix::from_rows(&[request.to_feature_row()]);
        let probabilities = bundle.predict(&raw)?;
        let p = probabilities[0];
        log::debug!("Scored request: p = {p:.6}");
        Ok(PredictionResponse {
            probability_of_default: round_probability(p),
        })
    }

    /// Parses, validates and scores a JSON request body.
    pub fn predict_json(&self, body: &str) -> Result<PredictionResponse, ServiceError> {
        self.bundle()?;
        let request = parse_request(body)?;
        self.predict(&request)
    }

    /// Answers a JSON body with a status code and a JSON response body.
    pub fn respond(&self, body: &str) -> (u16, String) {
        let (status, json) = match self.predict_json(body) {
            Ok(response) => (200, serde_json::to_string(&response)),
            Err(e) => {
                if e.status() == 500 {
                    log::error!("{e}");
                }
                (e.status(), serde_json::to_string(&e.to_response()))
            }
        };
        match json {
            Ok(json) => (status, json),
            Err(e) => (
                500,
                format!(
                    "{{\"status\":500,\"error\":\"computation_error\",\"message\":\"{}\",\"fields\":[]}}",
                    e.to_string().replace('"', "'")
                ),
            ),
        }
    }
}
