//! Content fingerprints for download bundles.
//!
//! A fingerprint is only a cache key for the session broker. Collisions cost an
//! extra cache miss at worst, because every hit is re-checked against the
//! session store before it is trusted.

use std::fmt;
use std::fmt::Write as _;

use crate::cache::{ContentBundle, fnv1a_64};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(bundle: &ContentBundle) -> Self {
        let digest = fnv1a_64(canonicalize(bundle).as_bytes());
        Self(format!("{digest:016x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serializes a bundle in a fixed field order.
///
/// Image URLs are an unordered set and are sorted; scripts keep their order.
/// Every value is length-prefixed so adjacent fields cannot run together.
pub fn canonicalize(bundle: &ContentBundle) -> String {
    let mut images: Vec<&str> = bundle.generated_images.iter().map(String::as_str).collect();
    images.sort_unstable();

    let mut out = String::new();
    write_list(&mut out, "generated_images", &images);
    write_opt(&mut out, "uploaded_image", bundle.uploaded_image.as_deref());
    let scripts: Vec<&str> = bundle.video_scripts.iter().map(String::as_str).collect();
    write_list(&mut out, "video_scripts", &scripts);
    write_opt(&mut out, "email_copy", bundle.email_copy.as_deref());
    write_opt(&mut out, "banner_copy", bundle.banner_copy.as_deref());
    write_opt(&mut out, "landing_page_concept", bundle.landing_page_concept.as_deref());
    out
}

fn write_value(out: &mut String, value: &str) {
    // Writing into a String cannot fail.
    let _ = write!(out, "{}:{value};", value.len());
}

fn write_opt(out: &mut String, name: &str, value: Option<&str>) {
    out.push_str(name);
    match value {
        Some(value) => {
            out.push('=');
            write_value(out, value);
        }
        None => out.push_str("~;"),
    }
    out.push('\n');
}

fn write_list(out: &mut String, name: &str, values: &[&str]) {
    let _ = write!(out, "{name}[{}]=", values.len());
    for value in values {
        write_value(out, value);
    }
    out.push('\n');
}
