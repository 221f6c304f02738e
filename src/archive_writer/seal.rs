//! Sealing the staging tree into the `.atls` container and validating it.

use anyhow::{anyhow, bail, Context, Result};
use sha2::Digest;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::records::{
    AccessibilityRecord, AssetRecord, ComputedTextNodeRecord, ConsoleRecord, EdgeRecord,
    ErrorRecord, Manifest, PageRecord,
};

/// Pack every file under `staging` into a zip at `out_path`.
///
/// Part files and media are already compressed, so they are stored; JSON
/// documents deflate.
pub fn seal_archive(staging: &Path, out_path: &Path) -> Result<()> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create archive parent dir")?;
    }
    let file = File::create(out_path)
        .with_context(|| format!("failed to create archive {}", out_path.display()))?;
    let mut zip = ZipWriter::new(file);

    let mut entries = Vec::new();
    collect(staging, staging, &mut entries)?;
    entries.sort();

    for rel in entries {
        let path = staging.join(&rel);
        let method = if rel.ends_with(".zst")
            || rel.ends_with(".jpg")
            || rel.ends_with(".png")
            || rel.ends_with(".gif")
        {
            CompressionMethod::Stored
        } else {
            CompressionMethod::Deflated
        };
        zip.start_file(
            rel.clone(),
            SimpleFileOptions::default().compression_method(method),
        )
        .with_context(|| format!("failed to start zip entry {rel}"))?;
        let mut src =
            File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        std::io::copy(&mut src, &mut zip)
            .with_context(|| format!("failed to write zip entry {rel}"))?;
    }

    zip.finish().context("failed to finish archive")?;
    Ok(())
}

fn collect(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

/// Reopen a sealed archive and schema-check the first `max_records` of
/// each dataset by deserializing them into their record types.
pub fn validate_archive(path: &Path, max_records: usize) -> Result<()> {
    let file = File::open(path)
        .with_context(|| format!("failed to open archive {}", path.display()))?;
    let mut archive = ZipArchive::new(file).context("archive is not a valid container")?;

    let manifest: Manifest = {
        let entry = archive
            .by_name("manifest.json")
            .context("archive has no manifest.json")?;
        serde_json::from_reader(entry).context("manifest.json is not valid")?
    };
    if manifest.atlas_version != "1.0" {
        bail!("unsupported atlas version {}", manifest.atlas_version);
    }

    for (dataset, parts) in &manifest.parts {
        let Some(first_part) = parts.first() else {
            continue;
        };
        let entry_name = format!("{dataset}/{first_part}");
        let entry = archive
            .by_name(&entry_name)
            .with_context(|| format!("manifest names missing part {entry_name}"))?;
        let decoder =
            zstd::stream::read::Decoder::new(entry).context("part is not valid zstd")?;
        let reader = BufReader::new(decoder);
        let mut checked = 0;
        for line in reader.lines() {
            if checked >= max_records {
                break;
            }
            let line = line.context("part is not valid UTF-8 JSONL")?;
            if line.is_empty() {
                continue;
            }
            check_record(dataset, &line)
                .with_context(|| format!("record {checked} of {entry_name}"))?;
            checked += 1;
        }
        debug!("validated {checked} records of {entry_name}");
    }

    // Spot-check integrity on the summary document.
    if let Some(expected) = manifest.integrity.files.get("summary.json") {
        let mut entry = archive
            .by_name("summary.json")
            .context("archive has no summary.json")?;
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        let actual = hex::encode(sha2::Sha256::digest(&bytes));
        if &actual != expected {
            bail!("summary.json integrity mismatch");
        }
    }

    Ok(())
}

fn check_record(dataset: &str, line: &str) -> Result<()> {
    match dataset {
        "pages" => serde_json::from_str::<PageRecord>(line).map(|_| ()),
        "edges" => serde_json::from_str::<EdgeRecord>(line).map(|_| ()),
        "assets" => serde_json::from_str::<AssetRecord>(line).map(|_| ()),
        "errors" => serde_json::from_str::<ErrorRecord>(line).map(|_| ()),
        "accessibility" => serde_json::from_str::<AccessibilityRecord>(line).map(|_| ()),
        "console" => serde_json::from_str::<ConsoleRecord>(line).map(|_| ()),
        "styles" => serde_json::from_str::<ComputedTextNodeRecord>(line).map(|_| ()),
        other => return Err(anyhow!("unknown dataset {other}")),
    }
    .with_context(|| format!("{dataset} record failed schema check"))
}
