//! HTTP handlers for image operations

use axum::Json;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::rejection::{
    BytesRejection, JsonRejection, PathRejection, QueryRejection,
};
use axum::extract::multipart::MultipartRejection;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::{RegistryError, RegistryResult};
use crate::record::{ImageRecord, NewImage};
use crate::service::ImageService;

/// Multipart field carrying image data.
const DATA_FIELD: &str = "data";

/// Router for image operations
pub(crate) fn router() -> Router<ImageService> {
    Router::new()
        .route("/images", get(list_images).post(register_image))
        .route("/image-importer", post(import_image))
        .route("/images/{name}", get(get_image).delete(delete_image))
        .route("/images/{name}/parents", get(get_parents))
        .route("/images/{name}/data", get(download_data).put(upload_data))
}

fn meta_link(name: &str) -> String {
    format!("/images/{name}")
}

fn data_link(name: &str) -> String {
    format!("/images/{name}/data")
}

#[derive(Debug, Serialize)]
struct SummaryLinks {
    meta: String,
    data: String,
}

/// One entry of the image listing
#[derive(Debug, Serialize)]
struct ImageSummary {
    name: String,
    links: SummaryLinks,
}

impl From<ImageRecord> for ImageSummary {
    fn from(record: ImageRecord) -> Self {
        Self {
            links: SummaryLinks {
                meta: meta_link(&record.name),
                data: data_link(&record.name),
            },
            name: record.name,
        }
    }
}

#[derive(Debug, Serialize)]
struct ImageLinks {
    #[serde(rename = "self")]
    this: String,
    data: String,
    parent: Option<String>,
    parents: String,
}

/// A full image record with its links
#[derive(Debug, Serialize)]
struct ImageDocument {
    data: ImageRecord,
    links: ImageLinks,
}

impl From<ImageRecord> for ImageDocument {
    fn from(record: ImageRecord) -> Self {
        let links = ImageLinks {
            this: meta_link(&record.name),
            data: data_link(&record.name),
            parent: record.parent.as_deref().map(meta_link),
            parents: format!("/images/{}/parents", record.name),
        };
        Self {
            data: record,
            links,
        }
    }
}

#[derive(Debug, Serialize)]
struct AncestorLinks {
    meta: String,
    data: String,
    parent: Option<String>,
}

/// One step of an image's ancestry
#[derive(Debug, Serialize)]
struct Ancestor {
    name: String,
    parent: Option<String>,
    links: AncestorLinks,
}

impl From<ImageRecord> for Ancestor {
    fn from(record: ImageRecord) -> Self {
        Self {
            links: AncestorLinks {
                meta: meta_link(&record.name),
                data: data_link(&record.name),
                parent: record.parent.as_deref().map(meta_link),
            },
            name: record.name,
            parent: record.parent,
        }
    }
}

/// Listing window
#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

/// List registered images
async fn list_images(
    State(service): State<ImageService>,
    page: Result<Query<Page>, QueryRejection>,
) -> RegistryResult<Json<Vec<ImageSummary>>> {
    let Query(page) = page?;
    let records = service.list(page.offset, page.limit).await?;
    Ok(Json(records.into_iter().map(ImageSummary::from).collect()))
}

/// Register an image without data
async fn register_image(
    State(service): State<ImageService>,
    payload: Result<Json<NewImage>, JsonRejection>,
) -> RegistryResult<StatusCode> {
    let Json(input) = payload?;
    service.register(input).await?;
    Ok(StatusCode::CREATED)
}

/// Import a complete image archive
async fn import_image(
    State(service): State<ImageService>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> RegistryResult<Response> {
    let body = body?;
    let media_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());

    let record = service.ingest(&body, media_type).await?;
    let location = meta_link(&record.name);

    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(ImageDocument::from(record)),
    )
        .into_response())
}

/// Get one image
async fn get_image(
    State(service): State<ImageService>,
    name: Result<Path<String>, PathRejection>,
) -> RegistryResult<Json<ImageDocument>> {
    let Path(name) = name?;
    let record = service.get(&name).await?;
    Ok(Json(record.into()))
}

/// Get the ancestry of an image, root first
async fn get_parents(
    State(service): State<ImageService>,
    name: Result<Path<String>, PathRejection>,
) -> RegistryResult<Json<Vec<Ancestor>>> {
    let Path(name) = name?;
    let ancestry = service.ancestry(&name).await?;
    Ok(Json(ancestry.into_iter().map(Ancestor::from).collect()))
}

/// Delete an image and its data
async fn delete_image(
    State(service): State<ImageService>,
    name: Result<Path<String>, PathRejection>,
) -> RegistryResult<StatusCode> {
    let Path(name) = name?;
    service.delete(&name).await?;
    Ok(StatusCode::OK)
}

/// Attach or replace image data from a multipart upload
async fn upload_data(
    State(service): State<ImageService>,
    name: Result<Path<String>, PathRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> RegistryResult<Json<ImageDocument>> {
    let Path(name) = name?;
    // Reject unknown images before reading the body.
    service.get(&name).await?;
    let mut multipart = multipart?;

    let scratch = service.scratch().await?;
    let local = scratch.join(DATA_FIELD);
    let mut declared_name = None;
    let mut received = false;

    while let Some(mut field) = multipart.next_field().await? {
        if field.name() != Some(DATA_FIELD) {
            continue;
        }

        declared_name = field.file_name().map(str::to_owned);
        let mut file = tokio::fs::File::create(&local).await?;
        while let Some(chunk) = field.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        received = true;
        break;
    }

    if !received {
        return Err(RegistryError::InvalidRequest(format!(
            "missing multipart field \"{DATA_FIELD}\""
        )));
    }

    let record = service
        .attach_data(&name, &local, declared_name.as_deref())
        .await?;
    Ok(Json(record.into()))
}

/// Stream image data
async fn download_data(
    State(service): State<ImageService>,
    name: Result<Path<String>, PathRejection>,
) -> RegistryResult<Response> {
    let Path(name) = name?;
    let (blob, stream) = service.open_data(&name).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, blob.media_type().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{blob}\""),
            ),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}
