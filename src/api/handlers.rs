use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{error, info, info_span, Instrument, Span};
use uuid::Uuid;

use super::{
    types::{ErrorResponse, SummarizeRequest, SummarizeResponse},
    AppState,
};

pub const NO_TEXT_ERROR: &str = "No text provided for summarization";

pub enum ApiError {
    MissingText,
    Inference(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Inference(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::MissingText => (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: NO_TEXT_ERROR.into(),
                }),
            )
                .into_response(),
            // Inference failures are opaque to the client.
            ApiError::Inference(err) => {
                error!("summarization failed: {err:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
            }
        }
    }
}

pub async fn summarize(
    State(state): State<AppState>,
    Json(req): Json<SummarizeRequest>,
) -> Result<Json<SummarizeResponse>, ApiError> {
    let text = match req.text {
        Some(text) if !text.is_empty() => text,
        _ => return Err(ApiError::MissingText),
    };

    let request_span = info_span!("summarize", request_id = %Uuid::new_v4());
    async move {
        info!(chars = text.chars().count(), "summarization request");

        // The blocking pool does not inherit the task's span.
        let summarizer = state.summarizer.clone();
        let span = Span::current();
        let summary =
            tokio::task::spawn_blocking(move || span.in_scope(|| summarizer.summarize(&text)))
                .await
                .map_err(anyhow::Error::from)??;

        info!(chars = summary.chars().count(), "summary generated");
        Ok::<_, ApiError>(Json(SummarizeResponse { summary }))
    }
    .instrument(request_span)
    .await
}
