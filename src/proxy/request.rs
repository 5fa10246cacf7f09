use anyhow::{Result, bail};

/// Origin coordinates and origin-form path extracted from a request
/// target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTarget {
    pub host: String,
    pub port: u16,
    pub path: String,
}

/// Split an absolute-form request target (`scheme://host[:port]/path`)
/// into host, port, and path. The port defaults to 80; the path to `/`.
pub fn parse_absolute_target(target: &str) -> Result<HttpTarget> {
    let Some(scheme_end) = target.find("://") else {
        bail!("request target '{target}' is not absolute-form");
    };
    let rest = &target[scheme_end + 3..];

    let (authority, path) = match rest.find('/') {
        Some(slash) => (&rest[..slash], rest[slash..].to_string()),
        None => (rest, "/".to_string()),
    };

    let (host, port) = split_authority(authority, 80)?;
    Ok(HttpTarget { host, port, path })
}

/// Split a CONNECT target (`host[:port]`, no scheme) into host and port.
/// The port defaults to 443.
pub fn parse_connect_target(target: &str) -> Result<(String, u16)> {
    if target.contains('/') {
        bail!("CONNECT target '{target}' must not contain a path");
    }
    split_authority(target, 443)
}

/// Split `host[:port]` on the last colon. The port, when present, must be
/// all digits and fit in [0, 65535].
fn split_authority(authority: &str, default_port: u16) -> Result<(String, u16)> {
    if authority.is_empty() {
        bail!("authority must not be empty");
    }
    if authority.chars().any(char::is_whitespace) {
        bail!("authority '{authority}' must not contain whitespace");
    }

    match authority.rfind(':') {
        Some(colon) => {
            let host = &authority[..colon];
            let port = &authority[colon + 1..];
            if host.is_empty() {
                bail!("authority '{authority}' is missing a host");
            }
            if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
                bail!("authority '{authority}' has a non-numeric port");
            }
            let port: u16 = port
                .parse()
                .map_err(|_| anyhow::anyhow!("authority '{authority}' port is out of range"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::{HttpTarget, parse_absolute_target, parse_connect_target};

    #[test]
    fn parses_full_absolute_target() {
        let parsed = parse_absolute_target("http://www.example.com:8080/page.html").unwrap();
        assert_eq!(
            parsed,
            HttpTarget {
                host: "www.example.com".to_string(),
                port: 8080,
                path: "/page.html".to_string(),
            }
        );
    }

    #[test]
    fn defaults_port_and_path() {
        let parsed = parse_absolute_target("http://example.com").unwrap();
        assert_eq!(parsed.host, "example.com");
        assert_eq!(parsed.port, 80);
        assert_eq!(parsed.path, "/");
    }

    #[test]
    fn keeps_query_in_path() {
        let parsed = parse_absolute_target("http://example.com/search?q=a+b&x=1").unwrap();
        assert_eq!(parsed.path, "/search?q=a+b&x=1");
    }

    #[test]
    fn rejects_origin_form_target() {
        let err = parse_absolute_target("/page.html").unwrap_err();
        assert!(err.to_string().contains("absolute-form"), "{err}");
    }

    #[test]
    fn rejects_port_with_non_digits() {
        assert!(parse_absolute_target("http://example.com:8o80/").is_err());
        assert!(parse_absolute_target("http://example.com:-1/").is_err());
        assert!(parse_absolute_target("http://example.com:/").is_err());
    }

    #[test]
    fn rejects_port_out_of_range() {
        let err = parse_absolute_target("http://example.com:65536/").unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err}");
    }

    #[test]
    fn rejects_empty_authority() {
        assert!(parse_absolute_target("http:///page").is_err());
    }

    #[test]
    fn connect_target_defaults_to_443() {
        assert_eq!(
            parse_connect_target("example.com").unwrap(),
            ("example.com".to_string(), 443)
        );
    }

    #[test]
    fn connect_target_with_explicit_port() {
        assert_eq!(
            parse_connect_target("example.com:8443").unwrap(),
            ("example.com".to_string(), 8443)
        );
    }

    #[test]
    fn connect_target_rejects_path_and_empty() {
        assert!(parse_connect_target("example.com/path").is_err());
        assert!(parse_connect_target("").is_err());
        assert!(parse_connect_target("example.com:").is_err());
    }
}
