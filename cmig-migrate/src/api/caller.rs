//! Caller identity extractor

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

use crate::error::ApiError;
use crate::guard::CallerContext;

pub const CLINIC_HEADER: &str = "x-clinic-id";
pub const ACTOR_HEADER: &str = "x-actor-id";

#[async_trait]
impl<S> FromRequestParts<S> for CallerContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| -> Result<Option<String>, ApiError> {
            parts
                .headers
                .get(name)
                .map(|v| {
                    v.to_str()
                        .map(|s| s.trim().to_string())
                        .map_err(|_| ApiError::BadRequest(format!("{} is not valid text", name)))
                })
                .transpose()
        };

        let clinic = header(CLINIC_HEADER)?
            .ok_or_else(|| ApiError::BadRequest(format!("missing {} header", CLINIC_HEADER)))?;
        let clinic_id = Uuid::parse_str(&clinic)
            .map_err(|_| ApiError::BadRequest(format!("{} must be a UUID", CLINIC_HEADER)))?;

        Ok(CallerContext::new(clinic_id, header(ACTOR_HEADER)?))
    }
}
