//! Turns a session's bundle into downloadable files.
//!
//! Text parts become `.txt` files; each image is fetched with one retry.
//! Images that still fail are reported as skipped instead of failing the whole
//! download. Archive packaging happens outside this crate.

use std::time::Duration;

use anyhow::{Result, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use crate::batch::{self, BatchReport};
use crate::cache::{ContentBundle, get_mime_type_from_path};

const FETCH_ATTEMPTS: u32 = 2;
const RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BundleFile {
    pub name: String,
    pub mime_type: String,
    pub data_base64: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedFile {
    pub source: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackagedBundle {
    pub files: Vec<BundleFile>,
    pub skipped: Vec<SkippedFile>,
}

fn text_file(name: &str, body: &str) -> BundleFile {
    BundleFile {
        name: name.to_string(),
        mime_type: "text/plain; charset=utf-8".to_string(),
        data_base64: STANDARD.encode(body.as_bytes()),
    }
}

/// The text parts of a bundle, skipping anything blank.
pub fn text_files(bundle: &ContentBundle) -> Vec<BundleFile> {
    let mut files = Vec::new();
    let scripts: Vec<&str> = bundle
        .video_scripts
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    if !scripts.is_empty() {
        files.push(text_file("video_scripts.txt", &scripts.join("\n\n---\n\n")));
    }
    let parts = [
        ("email_copy.txt", &bundle.email_copy),
        ("banner_copy.txt", &bundle.banner_copy),
        ("landing_page.txt", &bundle.landing_page_concept),
    ];
    for (name, value) in parts {
        if let Some(body) = value.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
            files.push(text_file(name, body));
        }
    }
    files
}

/// Image URLs in bundle order, paired with the file name they are packaged under.
pub fn image_sources(bundle: &ContentBundle) -> Vec<(String, String)> {
    let mut sources = Vec::new();
    if let Some(url) = bundle.uploaded_image.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        sources.push((url.to_string(), file_name("original", 0, url)));
    }
    for (index, url) in bundle
        .generated_images
        .iter()
        .map(|u| u.trim())
        .filter(|u| !u.is_empty())
        .enumerate()
    {
        sources.push((url.to_string(), file_name("generated", index + 1, url)));
    }
    sources
}

fn file_name(stem: &str, index: usize, url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path
        .rsplit('/')
        .next()
        .and_then(|last| last.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "png".to_string());
    if index == 0 {
        format!("{stem}.{ext}")
    } else {
        format!("{stem}_{index}.{ext}")
    }
}

async fn fetch_once(client: &Client, url: &str, timeout: Duration) -> Result<(String, Vec<u8>)> {
    let response = client.get(url).timeout(timeout).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("HTTP {status}"));
    }
    let mime_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
        .filter(|value| value.starts_with("image/"))
        .unwrap_or_else(|| get_mime_type_from_path(url).to_string());
    let bytes = response.bytes().await?;
    if bytes.is_empty() {
        return Err(anyhow!("empty body"));
    }
    Ok((mime_type, bytes.to_vec()))
}

async fn fetch_with_retry(client: &Client, url: &str, timeout: Duration) -> Result<(String, Vec<u8>)> {
    let mut last_error = anyhow!("no attempt made");
    for attempt in 1..=FETCH_ATTEMPTS {
        match fetch_once(client, url, timeout).await {
            Ok(found) => return Ok(found),
            Err(err) => {
                debug!(%url, attempt, error = %err, "image download failed");
                last_error = err;
                if attempt < FETCH_ATTEMPTS {
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }
    Err(last_error)
}

/// Collects every file of `bundle`. Never fails; unreachable images are skipped.
pub async fn package(client: &Client, bundle: &ContentBundle, timeout: Duration) -> PackagedBundle {
    let mut files = Vec::new();
    let items = image_sources(bundle)
        .into_iter()
        .map(|(url, name)| (url.clone(), (url, name)))
        .collect();
    let outcomes = batch::run_isolated(items, batch::DEFAULT_CONCURRENCY, |(url, name): (String, String)| {
        let client = client.clone();
        async move {
            let (mime_type, bytes) = fetch_with_retry(&client, &url, timeout).await?;
            Ok::<_, anyhow::Error>((name, mime_type, bytes))
        }
    })
    .await;
    let report = BatchReport::from_outcomes(outcomes);

    for (_, (name, mime_type, bytes)) in report.succeeded {
        files.push(BundleFile {
            name,
            mime_type,
            data_base64: STANDARD.encode(bytes),
        });
    }
    files.extend(text_files(bundle));

    let skipped = report
        .failed
        .into_iter()
        .map(|(source, err)| SkippedFile {
            source,
            reason: format!("{err:#}"),
        })
        .collect();
    PackagedBundle { files, skipped }
}
