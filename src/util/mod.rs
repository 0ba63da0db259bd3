use std::fs;
use std::path::Path;

use tracing::{debug, warn};

/// Make a string safe to use as a single path component.
pub fn sanitize_name(name: &str) -> String {
    name.replace(['/', ' '], "_")
}

fn directory_number(name: &str, prefix: &str) -> Option<u32> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('_')?;
    let digits = rest.strip_prefix("perf_").unwrap_or(rest);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Next free index for `<prefix>_<n>` under `base`, also counting the older
/// `<prefix>_perf_<n>` spelling. Zero when nothing exists yet.
pub fn next_directory_index(base: &Path, prefix: &str) -> u32 {
    let entries = match fs::read_dir(base) {
        Ok(entries) => entries,
        Err(err) => {
            if base.exists() {
                warn!(path = %base.display(), error = %err, "cannot scan output directory");
            }
            return 0;
        }
    };

    let highest = entries
        .filter_map(Result::ok)
        .filter_map(|entry| directory_number(&entry.file_name().to_string_lossy(), prefix))
        .max();

    debug!(path = %base.display(), prefix, highest = ?highest, "scanned output directories");
    highest.map(|n| n + 1).unwrap_or(0)
}
