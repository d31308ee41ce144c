//! Shared helpers for driving the router in tests.

use std::io::Cursor;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request},
    response::Response,
    Router,
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

use crate::backend::scripted::{Calls, ScriptedLoader};
use crate::backend::LoadConfig;
use crate::config::InferenceSettings;
use crate::registry::{ModelRegistry, ModelSpec};
use crate::{router, AppState};

const BOUNDARY: &str = "gemma3n-test-boundary";

/// Router over `e2b` -> `test-e2b` and `e4b` -> `test-e4b`.
pub async fn build_app(
    loader: ScriptedLoader,
    slots: usize,
    settings: InferenceSettings,
) -> (Router, Arc<Calls>) {
    build_app_with_limit(loader, slots, settings, 10 * 1024 * 1024).await
}

pub async fn build_app_with_limit(
    loader: ScriptedLoader,
    slots: usize,
    settings: InferenceSettings,
    max_upload_bytes: usize,
) -> (Router, Arc<Calls>) {
    let specs = [
        ModelSpec::new("e2b", "test-e2b"),
        ModelSpec::new("e4b", "test-e4b"),
    ];
    let registry = ModelRegistry::load(&loader, &specs, &LoadConfig::default())
        .await
        .unwrap();
    let state = AppState::new(registry, slots, settings);
    (router(state, max_upload_bytes), loader.calls.clone())
}

pub fn jpeg_10x10() -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 10, Rgb([120, 90, 60])));
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Jpeg).unwrap();
    out.into_inner()
}

pub fn multipart_body(image: Option<&[u8]>, model_choice: Option<&str>) -> Vec<u8> {
    let mut body = Vec::new();
    if let Some(choice) = model_choice {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"model_choice\"\r\n\r\n{}\r\n",
                BOUNDARY, choice
            )
            .as_bytes(),
        );
    }
    if let Some(image) = image {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"item.jpg\"\r\nContent-Type: image/jpeg\r\n\r\n",
                BOUNDARY
            )
            .as_bytes(),
        );
        body.extend_from_slice(image);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

pub fn inference_request(body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/gemma3n/inference")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub async fn collect_body(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
