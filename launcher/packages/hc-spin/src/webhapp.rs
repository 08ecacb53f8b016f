//! Unpacking of `.webhapp` bundles.
//!
//! A webhapp is a gzip-compressed msgpack map of `{manifest, resources}`.
//! The manifest names two bundled resources: the `.happ` (itself a bundle,
//! written out unchanged) and a zip archive holding the UI assets.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

use hc_spin_error::SpinError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    Bundled(String),
    Path(PathBuf),
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebHappManifest {
    #[serde(default)]
    pub name: Option<String>,
    pub ui: Location,
    pub happ_manifest: Location,
}

#[derive(Debug, Deserialize)]
struct WebHappBundle {
    manifest: WebHappManifest,
    #[serde(default)]
    resources: HashMap<String, serde_bytes::ByteBuf>,
}

/// Where the parts of an unpacked webhapp ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackedWebhapp {
    pub happ_path: PathBuf,
    pub ui_dir: PathBuf,
    pub ui_files: usize,
}

fn bundle_error(message: impl Into<String>) -> SpinError {
    SpinError::Bundle {
        message: message.into(),
    }
}

/// Writes the `.happ` of `webhapp_path` to `happ_path` and extracts its UI into `ui_dir`.
pub async fn unpack(
    webhapp_path: &Path,
    happ_path: &Path,
    ui_dir: &Path,
) -> Result<UnpackedWebhapp, SpinError> {
    let bytes = tokio::fs::read(webhapp_path).await?;
    let happ_path = happ_path.to_path_buf();
    let ui_dir = ui_dir.to_path_buf();
    let unpacked = tokio::task::spawn_blocking(move || unpack_bytes(&bytes, &happ_path, &ui_dir))
        .await
        .map_err(|err| bundle_error(format!("unpack task failed: {err}")))??;
    tracing::info!(
        happ = %unpacked.happ_path.display(),
        ui_dir = %unpacked.ui_dir.display(),
        ui_files = unpacked.ui_files,
        "unpacked webhapp"
    );
    Ok(unpacked)
}

fn unpack_bytes(bytes: &[u8], happ_path: &Path, ui_dir: &Path) -> Result<UnpackedWebhapp, SpinError> {
    let mut decoded = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut decoded)
        .map_err(|err| bundle_error(format!("webhapp is not gzip compressed: {err}")))?;
    let mut bundle: WebHappBundle = rmp_serde::from_slice(&decoded)
        .map_err(|err| bundle_error(format!("failed to decode webhapp: {err}")))?;

    let happ_bytes = take_resource(&mut bundle, "happ", |manifest| &manifest.happ_manifest)?;
    let ui_zip = take_resource(&mut bundle, "ui", |manifest| &manifest.ui)?;

    if let Some(parent) = happ_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(happ_path, happ_bytes)?;
    let ui_files = extract_zip(&ui_zip, ui_dir)?;

    Ok(UnpackedWebhapp {
        happ_path: happ_path.to_path_buf(),
        ui_dir: ui_dir.to_path_buf(),
        ui_files,
    })
}

fn take_resource(
    bundle: &mut WebHappBundle,
    what: &str,
    location: impl Fn(&WebHappManifest) -> &Location,
) -> Result<Vec<u8>, SpinError> {
    let name = match location(&bundle.manifest) {
        Location::Bundled(name) => name.clone(),
        other => {
            return Err(bundle_error(format!(
                "the {what} of a webhapp must be bundled, found {other:?}"
            )))
        }
    };
    bundle
        .resources
        .remove(&name)
        .map(serde_bytes::ByteBuf::into_vec)
        .ok_or_else(|| bundle_error(format!("webhapp is missing its {what} resource `{name}`")))
}

/// Extracts `zip_bytes` into `target`. Entries that would land outside of
/// `target` fail the whole extraction.
pub fn extract_zip(zip_bytes: &[u8], target: &Path) -> Result<usize, SpinError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(zip_bytes))
        .map_err(|err| bundle_error(format!("failed to open ui zip: {err}")))?;
    std::fs::create_dir_all(target)?;

    let mut files = 0;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| bundle_error(format!("failed to read ui zip entry {index}: {err}")))?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(bundle_error(format!(
                "ui zip entry `{}` escapes the target directory",
                entry.name()
            )));
        };
        let out_path = target.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out)?;
        files += 1;
    }
    Ok(files)
}
