use anyhow::{bail, Context, Result};
use dandi_upload::prelude::*;
use dandi_upload::EventStream;
use futures::StreamExt;
use std::path::PathBuf;
use tracing::{debug, info, warn};

const USAGE: &str = "usage: dandi-upload <path> <dandiset-id> [asset-path] [metadata.json]";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (path, dandiset_id) = match (args.first(), args.get(1)) {
        (Some(path), Some(dandiset_id)) => (PathBuf::from(path), dandiset_id.clone()),
        _ => bail!(USAGE),
    };
    let asset_path = match args.get(2) {
        Some(asset_path) => asset_path.clone(),
        None => path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .context("cannot derive an asset path, pass one explicitly")?,
    };
    let metadata: AssetMetadata = match args.get(3) {
        Some(file) => {
            let raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", file))?
        }
        None => AssetMetadata::new(),
    };

    let config = UploadConfig::from_env()?;
    let client = HttpArchiveClient::from_env()?.with_retry(config.retry.clone());
    let uploader = ArchiveUploader::new(client, config);

    info!(path = %path.display(), dandiset = %dandiset_id, asset = %asset_path, "Uploading");
    let mut events = uploader.upload_path(path, metadata, UploadTarget::new(dandiset_id, asset_path));

    let interrupted = tokio::select! {
        result = report(&mut events) => {
            result?;
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };
    drop(events);

    if interrupted {
        warn!("Interrupted, cancelling open upload sessions");
        let cancelled = uploader.cancel_pending().await;
        bail!("upload interrupted, {} session(s) cancelled", cancelled);
    }
    Ok(())
}

async fn report(events: &mut EventStream) -> Result<()> {
    while let Some(event) = events.next().await {
        match event? {
            UploadEvent::Status(phase) => info!(?phase, "Upload phase"),
            UploadEvent::Progress(progress) => debug!(
                uploaded = progress.uploaded_bytes,
                total = progress.total_bytes,
                "{:.1}%",
                progress.percent()
            ),
            UploadEvent::Done(asset) => println!("{}\t{}", asset.asset_id, asset.path),
        }
    }
    Ok(())
}
