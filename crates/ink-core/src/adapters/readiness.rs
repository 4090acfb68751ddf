use std::sync::LazyLock;

use regex::Regex;

static JUPYTER_BANNER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"Jupyter Server [\w.+-]+ is running at").ok());

const SERVICE_BANNERS: [&str; 4] = [
    "HTTP server listening on",
    "SSH server starting",
    "Navigate to this URL",
    "Elapsed time",
];

/// Whether a job's live output shows its interactive service accepting connections.
pub fn service_ready(output: &str) -> bool {
    if let Some(jupyter) = JUPYTER_BANNER.as_ref()
        && jupyter.is_match(output)
    {
        return true;
    }
    SERVICE_BANNERS.iter().any(|banner| output.contains(banner))
}
