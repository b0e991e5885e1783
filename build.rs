use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Deserialize)]
struct MetricRegistry {
    metrics: Vec<MetricEntry>,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct MetricEntry {
    symbol: String,
    name: String,
    kind: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct ManifestFile {
    documents: Vec<ManifestDocument>,
}

#[derive(Deserialize)]
struct ManifestDocument {
    name: String,
    path: String,
    sha256: String,
}

fn normalize_hash(value: &str) -> String {
    value.trim().trim_start_matches("0x").to_ascii_lowercase()
}

fn sha256_file(path: impl AsRef<Path>) -> Result<String, Box<dyn Error>> {
    let data = fs::read(path.as_ref())?;
    Ok(hex::encode(Sha256::digest(&data)))
}

fn verify_manifests(repo_root: &Path) -> Result<(), Box<dyn Error>> {
    let manifest_dir = repo_root.join("manifests");
    let manifest_path = manifest_dir.join("teb_manifest.json");
    println!("cargo:rerun-if-changed={}", manifest_path.display());
    let manifest: ManifestFile = serde_json::from_str(&fs::read_to_string(&manifest_path)?)?;

    for doc in &manifest.documents {
        let absolute = manifest_dir.join(&doc.path);
        if !absolute.exists() {
            return Err(format!(
                "manifest entry {} points at missing file {}",
                doc.name,
                absolute.display()
            )
            .into());
        }
        let observed = sha256_file(&absolute)?;
        if normalize_hash(&observed) != normalize_hash(&doc.sha256) {
            return Err(format!(
                "manifest entry {} hash mismatch (manifest {}, observed {}); refresh manifests/teb_manifest.json after editing the registry",
                doc.name, doc.sha256, observed
            )
            .into());
        }
    }

    Ok(())
}

fn kind_variant(kind: &str) -> Result<&'static str, Box<dyn Error>> {
    match kind {
        "rate" => Ok("MetricKind::Rate"),
        "scalar" => Ok("MetricKind::Scalar"),
        other => Err(format!("unknown metric kind '{other}' in registry").into()),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let repo_root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    verify_manifests(&repo_root)?;

    let registry_path = repo_root.join("registry/metric_registry.json");
    println!("cargo:rerun-if-changed={}", registry_path.display());

    let registry: MetricRegistry = serde_json::from_str(&fs::read_to_string(&registry_path)?)?;

    let mut generated = String::new();
    for metric in &registry.metrics {
        generated.push_str(&format!(
            "pub const {}: &str = \"{}\";\n",
            metric.symbol, metric.name
        ));
    }
    generated.push_str("\npub const TEB_METRICS: &[(&str, MetricKind)] = &[\n");
    for metric in &registry.metrics {
        generated.push_str(&format!(
            "    ({}, {}),\n",
            metric.symbol,
            kind_variant(&metric.kind)?
        ));
    }
    generated.push_str("];\n");

    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);
    fs::write(out_dir.join("teb_metrics.rs"), generated)?;

    Ok(())
}
