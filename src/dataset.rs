use std::fs;
use std::path::Path;

use crate::error::Result;
use crate::types::Sample;

fn is_jsonl(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "jsonl")
}

/// Reads samples from a `.jsonl` file (one per line) or a `.json` array,
/// keeping at most `limit`.
pub fn load_samples(path: &Path, limit: Option<usize>) -> Result<Vec<Sample>> {
    let text = fs::read_to_string(path)?;
    let mut samples: Vec<Sample> = if is_jsonl(path) {
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<std::result::Result<_, _>>()?
    } else {
        serde_json::from_str(&text)?
    };
    if let Some(limit) = limit {
        samples.truncate(limit);
    }
    Ok(samples)
}

pub fn save_samples(path: &Path, samples: &[Sample]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let text = if is_jsonl(path) {
        let mut out = String::new();
        for sample in samples {
            out.push_str(&serde_json::to_string(sample)?);
            out.push('\n');
        }
        out
    } else {
        serde_json::to_string_pretty(samples)?
    };
    fs::write(path, text)?;
    Ok(())
}
