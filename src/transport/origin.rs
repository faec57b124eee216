
use url::Url;

/// Normalize a declared source URL to `scheme://host[:port]`. Default
/// ports are stripped; `file:` URLs collapse to `file://`.
pub fn normalize_origin(source_url: &str) -> Option<String> {
    let url = Url::parse(source_url).ok()?;

    if url.scheme() == "file" {
        return Some("file://".to_string());
    }

    let host = url.host_str()?;
    // `Url::port` is already None when the port is the scheme default.
    match url.port() {
        Some(port) => Some(format!("{}://{}:{}", url.scheme(), host, port)),
        None => Some(format!("{}://{}", url.scheme(), host)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports_stripped() {
        assert_eq!(
            normalize_origin("http://example.com:80/page").as_deref(),
            Some("http://example.com")
        );
        assert_eq!(
            normalize_origin("https://example.com:443/").as_deref(),
            Some("https://example.com")
        );
    }

    #[test]
    fn test_explicit_port_kept() {
        assert_eq!(
            normalize_origin("https://example.com:8443/app").as_deref(),
            Some("https://example.com:8443")
        );
        assert_eq!(
            normalize_origin("http://localhost:3000").as_deref(),
            Some("http://localhost:3000")
        );
    }

    #[test]
    fn test_path_and_query_ignored() {
        assert_eq!(
            normalize_origin("https://a.example.com/deep/path?q=1#frag").as_deref(),
            Some("https://a.example.com")
        );
    }

    #[test]
    fn test_file_collapses() {
        assert_eq!(
            normalize_origin("file:///home/user/page.html").as_deref(),
            Some("file://")
        );
    }

    #[test]
    fn test_unparseable_is_none() {
        assert_eq!(normalize_origin("not a url"), None);
    }
}
