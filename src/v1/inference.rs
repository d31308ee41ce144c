use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use axum::{
    body::Body,
    extract::{Multipart, State},
    http::header,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::stream::Stream;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::{debug, error, info, Instrument};
use uuid::Uuid;

use super::prompt::classification_messages;
use crate::backend::{BackendError, EncodedInput, TextSink};
use crate::error::ApiError;
use crate::registry::ModelEntry;
use crate::vision::decode_image;
use crate::AppState;

struct InferenceForm {
    image: Bytes,
    model_choice: String,
}

async fn read_form(mut multipart: Multipart) -> Result<InferenceForm, ApiError> {
    let mut image = None;
    let mut model_choice = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => image = Some(field.bytes().await?),
            "model_choice" => model_choice = Some(field.text().await?),
            _ => debug!(field = %name, "ignoring unknown form field"),
        }
    }

    Ok(InferenceForm {
        image: image.ok_or(ApiError::MissingField("image"))?,
        model_choice: model_choice.ok_or(ApiError::MissingField("model_choice"))?,
    })
}

/// Decode, template and encode. CPU bound, so it runs off the async workers.
async fn prepare(entry: Arc<ModelEntry>, image: Bytes) -> Result<EncodedInput, ApiError> {
    tokio::task::spawn_blocking(move || -> Result<EncodedInput, ApiError> {
        let raster = decode_image(&image)?;
        let text = entry
            .tokenizer
            .apply_chat_template(&classification_messages(), true)?;
        Ok(entry.tokenizer.encode(&raster, &text)?)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("preparation task failed: {}", e)))?
}

async fn acquire_slot(state: &AppState) -> Result<OwnedSemaphorePermit, ApiError> {
    let acquire = state.generation_slots.clone().acquire_owned();
    match tokio::time::timeout(state.settings.queue_timeout, acquire).await {
        Ok(Ok(permit)) => Ok(permit),
        Ok(Err(_)) | Err(_) => Err(ApiError::Busy),
    }
}

/// Forward text increments until the generator drops its sender.
fn text_stream(mut rx: mpsc::Receiver<String>) -> impl Stream<Item = Result<Bytes, Infallible>> {
    stream! {
        let mut chunks = 0usize;
        while let Some(text) = rx.recv().await {
            chunks += 1;
            yield Ok(Bytes::from(text));
        }
        debug!(chunks, "response stream finished");
    }
}

/// POST /gemma3n/inference
///
/// Streams the model's classification of the uploaded image as plain text.
/// Everything that can fail before generation starts is reported as a JSON
/// error; once streaming has begun a failure just ends the body.
#[tracing::instrument(skip_all, fields(request_id = %Uuid::new_v4(), model = tracing::field::Empty))]
pub async fn inference(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let form = read_form(multipart).await?;

    let entry = state
        .registry
        .get(&form.model_choice)
        .ok_or_else(|| ApiError::invalid_model_choice(&state.registry.keys()))?;
    tracing::Span::current().record("model", entry.key.as_str());

    let input = prepare(entry.clone(), form.image).await?;
    let permit = acquire_slot(&state).await?;

    let (tx, rx) = mpsc::channel(state.settings.stream_buffer);
    let sampling = state.settings.sampling.clone();
    let model = entry.model.clone();

    tokio::spawn(
        async move {
            let _permit = permit;
            let started = Instant::now();
            match model.generate(input, &sampling, TextSink::new(tx)).await {
                Ok(()) => info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "generation finished"
                ),
                Err(BackendError::Cancelled) => {
                    info!("client disconnected, generation cancelled")
                }
                Err(e) => error!("generation failed mid-stream: {}", e),
            }
        }
        .in_current_span(),
    );

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(text_stream(rx)),
    )
        .into_response())
}
