//! Endpoint construction helpers.

/// Strip trailing slashes so endpoints can be appended without doubling them.
///
/// ```
/// use parley::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("https://api.example.com/v1///"), "https://api.example.com/v1");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Join a base URL and an endpoint path with exactly one slash.
///
/// ```
/// use parley::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("https://api.example.com/v1/", "/chat/completions"),
///     "https://api.example.com/v1/chat/completions"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{normalized_base}/{endpoint}")
}

/// Model ids are sometimes written with the `models/` resource prefix that
/// Gemini uses in its own listings; URLs need the bare id.
pub fn strip_model_prefix(model: &str) -> &str {
    model.strip_prefix("models/").unwrap_or(model)
}
