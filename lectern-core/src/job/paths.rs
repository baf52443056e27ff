use std::path::{Path, PathBuf};

use regex::Regex;
use sha2::{Digest, Sha256};

const FALLBACK_STEM_HEX_CHARS: usize = 12;
const SUFFIX_HEX_CHARS: usize = 8;

/// Turns lecture identifiers into file-system safe stems.
#[derive(Debug, Clone)]
pub struct StemSanitizer {
    disallowed: Regex,
    whitespace: Regex,
}

impl Default for StemSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl StemSanitizer {
    pub fn new() -> Self {
        Self {
            disallowed: Regex::new(r"[^\w\s-]").expect("valid regex"),
            whitespace: Regex::new(r"\s+").expect("valid regex"),
        }
    }

    /// Depends on the id alone. An id that sanitising had to change gets a
    /// digest suffix, so two distinct ids never share a stem.
    pub fn stem(&self, lecture_id: &str) -> String {
        let stripped = self.disallowed.replace_all(lecture_id, "");
        let stem = self.whitespace.replace_all(stripped.trim(), "_").into_owned();
        let digest = hex::encode(Sha256::digest(lecture_id.as_bytes()));
        if stem.is_empty() {
            return format!("lecture-{}", &digest[..FALLBACK_STEM_HEX_CHARS]);
        }
        if stem == lecture_id {
            return stem;
        }
        format!("{stem}-{}", &digest[..SUFFIX_HEX_CHARS])
    }
}

/// Deterministic per-job layout under the work directory. Each job owns
/// its `dir` exclusively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub stem: String,
    pub dir: PathBuf,
    pub input: PathBuf,
    pub partial: PathBuf,
    pub output: PathBuf,
    pub marker: PathBuf,
    /// Names the lecture that owns `dir`.
    pub owner: PathBuf,
}

impl JobPaths {
    pub fn new(work_dir: &Path, stem: &str, input_ext: &str, output_ext: &str) -> Self {
        let dir = work_dir.join(stem);
        let input = dir.join(format!("{stem}.input.{input_ext}"));
        let partial = dir.join(format!("{stem}.input.{input_ext}.part"));
        let output = dir.join(format!("{stem}.output.{output_ext}"));
        let marker = dir.join(format!("{stem}.output.{output_ext}.done"));
        let owner = dir.join(format!("{stem}.lecture"));
        Self {
            stem: stem.to_string(),
            dir,
            input,
            partial,
            output,
            marker,
            owner,
        }
    }
}
