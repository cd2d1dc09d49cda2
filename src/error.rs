use log::error;
use rocket::http::Status;
use rocket::serde::json::Json;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Internal(String),
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound(format!("{} not found", what.into()))
    }

    pub fn status(&self) -> Status {
        match self {
            Self::NotFound(_) => Status::NotFound,
            Self::Forbidden(_) => Status::Forbidden,
            Self::Validation(_) => Status::BadRequest,
            Self::Internal(_) | Self::Database(_) | Self::Io(_) => Status::InternalServerError,
        }
    }
}

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub detail: String,
}

impl<'r> rocket::response::Responder<'r, 'static> for Error {
    fn respond_to(self, req: &'r rocket::Request<'_>) -> rocket::response::Result<'static> {
        let status = self.status();
        if status == Status::InternalServerError {
            error!("{} {} failed: {}", req.method(), req.uri(), self);
        }
        (status, Json(ErrorBody {
            detail: self.to_string(),
        })).respond_to(req)
    }
}
