//! URL helpers shared by the CLI and the batch planner.

use url::Url;

/// Maximum length of a URL slug in output file names.
pub const MAX_SLUG_LEN: usize = 60;

/// Default container extension for recordings.
pub const OUTPUT_EXTENSION: &str = "mp4";

/// Errors from URL validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UrlError {
    #[error("URL is empty")]
    Empty,
    #[error("URL '{0}' could not be parsed")]
    Unparseable(String),
    #[error("URL '{0}' must use http or https")]
    UnsupportedScheme(String),
}

/// Parse and check that a URL is an http(s) page address.
pub fn validate_page_url(raw: &str) -> Result<Url, UrlError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(UrlError::Empty);
    }

    let url = Url::parse(raw).map_err(|_| UrlError::Unparseable(raw.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(UrlError::UnsupportedScheme(raw.to_string())),
    }
}

/// Derive a filesystem-safe slug from a URL.
///
/// Uses the host (without `www.`) followed by the path and query, lowercased,
/// with every run of non-alphanumeric characters collapsed to `-`.
///
/// # Examples
/// ```
/// use pagecap_models::utils::url_slug;
/// assert_eq!(url_slug("https://www.example.com/videos/Intro_1"), "example-com-videos-intro-1");
/// ```
pub fn url_slug(raw: &str) -> String {
    let source = match Url::parse(raw.trim()) {
        Ok(url) => {
            let host = url.host_str().unwrap_or_default();
            let host = host.strip_prefix("www.").unwrap_or(host);
            let query = url.query().unwrap_or_default();
            format!("{}{} {}", host, url.path(), query)
        }
        Err(_) => raw.to_string(),
    };

    let mut slug = String::with_capacity(source.len());
    let mut pending_dash = false;
    for c in source.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }

    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        while slug.ends_with('-') {
            slug.pop();
        }
    }

    if slug.is_empty() {
        "recording".to_string()
    } else {
        slug
    }
}

/// Output file name for the job at `index` (zero based) of a batch.
pub fn output_file_name(index: usize, url: &str) -> String {
    format!("{:03}-{}.{}", index + 1, url_slug(url), OUTPUT_EXTENSION)
}
