//! Utility functions for file names and response inspection

/// Content types whose responses may be named after the URL when no
/// `Content-Disposition` header is sent
const URL_NAMED_CONTENT_TYPES: &[&str] = &["/x-netcdf", "/octet-stream"];

/// Determine the file name of an HTTP download
///
/// Order of preference:
/// 1. `filename*=` (RFC 5987, percent-encoded) or `filename=` in `Content-Disposition`
/// 2. the last URL path segment, only for netCDF or octet-stream responses
///
/// Returns `None` when neither applies; the caller decides whether that is fatal.
///
/// # Examples
///
/// ```no_run
/// use dataset_fetch::utils::extract_filename_from_response;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let response = reqwest::get("https://example.com/data/S1A_20240101.nc").await?;
/// let filename = extract_filename_from_response(&response, "https://example.com/data/S1A_20240101.nc");
/// # Ok(())
/// # }
/// ```
pub fn extract_filename_from_response(response: &reqwest::Response, url: &str) -> Option<String> {
    let headers = response.headers();

    if let Some(content_disposition) = headers.get(reqwest::header::CONTENT_DISPOSITION)
        && let Ok(value) = content_disposition.to_str()
        && let Some(name) = filename_from_content_disposition(value)
    {
        return Some(name);
    }

    if let Some(content_type) = headers.get(reqwest::header::CONTENT_TYPE)
        && let Ok(value) = content_type.to_str()
    {
        let value = value.to_ascii_lowercase();
        if URL_NAMED_CONTENT_TYPES.iter().any(|t| value.contains(t)) {
            return filename_from_url(url);
        }
    }

    tracing::error!(
        url = %url,
        status = %response.status(),
        "could not find a file name in the response"
    );
    None
}

/// Parse the file name out of a `Content-Disposition` header value
///
/// `filename*=` wins over `filename=` when both are present.
pub fn filename_from_content_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    for part in value.split(';') {
        let part = part.trim();
        if let Some(encoded) = strip_prefix_ignore_case(part, "filename*=") {
            // charset'lang'percent-encoded-name
            let encoded = encoded.trim_matches('"');
            let encoded = encoded.rfind('\'').map_or(encoded, |idx| &encoded[idx + 1..]);
            if let Ok(decoded) = urlencoding::decode(encoded)
                && let Some(name) = sanitize_file_name(&decoded)
            {
                return Some(name);
            }
        } else if let Some(name) = strip_prefix_ignore_case(part, "filename=")
            && plain.is_none()
        {
            plain = sanitize_file_name(name.trim_matches('"'));
        }
    }
    plain
}

/// Last non-empty path segment of a URL, percent-decoded
///
/// Works for `http`, `ftp` and `file` URLs as well as bare absolute paths.
pub fn filename_from_url(url: &str) -> Option<String> {
    let path = match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.to_string(),
    };
    let last = path.rsplit('/').find(|segment| !segment.is_empty())?;
    let decoded = urlencoding::decode(last).ok()?;
    sanitize_file_name(&decoded)
}

/// Reduce a remotely supplied name to a single safe path component
///
/// Directory parts are dropped; empty names and `.`/`..` are rejected.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next()?.trim();
    if last.is_empty() || last == "." || last == ".." {
        return None;
    }
    Some(last.to_string())
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    if value.len() >= prefix.len()
        && value.is_char_boundary(prefix.len())
        && value[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}
