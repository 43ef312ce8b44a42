pub mod campaign_store;
pub mod hash;
pub mod records;
pub mod repository;
pub mod session_store;
pub mod storage;

pub use campaign_store::FileCampaignStore;
pub use hash::{content_digest, fnv1a_64};
pub use records::*;
pub use repository::{CampaignRepository, ObjectStore, SessionRepository};
pub use session_store::FileSessionStore;
pub use storage::LocalFileStorage;

/// Image types accepted for upload and download, as (extension, MIME type).
const IMAGE_TYPES: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("webp", "image/webp"),
    ("gif", "image/gif"),
    ("bmp", "image/bmp"),
    ("svg", "image/svg+xml"),
    ("avif", "image/avif"),
];

/// File extension for an image MIME type. Parameters such as `; charset=` are ignored.
pub fn extension_for_mime(mime_type: &str) -> Option<&'static str> {
    let essence = mime_type.split(';').next().unwrap_or_default().trim();
    if essence.eq_ignore_ascii_case("image/jpg") {
        return Some("jpg");
    }
    IMAGE_TYPES
        .iter()
        .find(|(_, mime)| mime.eq_ignore_ascii_case(essence))
        .map(|(ext, _)| *ext)
}

/// Best-effort MIME type for a stored image, from its file extension.
pub fn get_mime_type_from_path(path: &str) -> &'static str {
    path.rsplit_once('.')
        .and_then(|(_, ext)| IMAGE_TYPES.iter().find(|(known, _)| known.eq_ignore_ascii_case(ext)))
        .map(|(_, mime)| *mime)
        .unwrap_or("application/octet-stream")
}
