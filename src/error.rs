use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::models::{RecipeId, UserId};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Recipe {0} not found")]
    RecipeNotFound(RecipeId),

    #[error("User {0} not found")]
    UserNotFound(UserId),

    #[error("Recipe store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    #[error("Missing or invalid viewer identity")]
    MissingViewer,
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::RecipeNotFound(_) | AppError::UserNotFound(_) => StatusCode::NOT_FOUND,
            AppError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::MissingViewer => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }

        (status, self.to_string()).into_response()
    }
}
