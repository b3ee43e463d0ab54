// Parse semantic version string (e.g. "1.2.3") into (major, minor, patch)
pub fn parse_semver(tag: &str) -> Option<(u64, u64, u64)> {
    let parts: Vec<_> = tag.split('.').collect();
    if parts.len() >= 3 {
        let major = parts[0].parse().ok()?;
        let minor = parts[1].parse().ok()?;
        let patch = parts[2]
            .split(|c: char| !c.is_ascii_digit())
            .next()?
            .parse()
            .ok()?;
        Some((major, minor, patch))
    } else {
        None
    }
}

/// Extract the version encoded in a container image tag, e.g.
/// `opentext/vertica-k8s:24.3.0-0` -> `(24, 3, 0)`. Digest-pinned or
/// `latest`-tagged images carry no comparable version and return `None`.
pub fn image_version(image: &str) -> Option<(u64, u64, u64)> {
    if image.contains('@') {
        return None;
    }
    // the tag separator is the last ':' after the last '/', so registry
    // ports do not confuse the split
    let after_slash = image.rsplit('/').next()?;
    let tag = after_slash.split(':').nth(1)?;
    parse_semver(tag)
}

#[cfg(test)]
mod test {
    use super::{image_version, parse_semver};

    #[test]
    fn test_parse_semver() {
        assert_eq!(parse_semver("24.3.0"), Some((24, 3, 0)));
        assert_eq!(parse_semver("24.3.0-0"), Some((24, 3, 0)));
        assert_eq!(parse_semver("latest"), None);
        assert_eq!(parse_semver("24.3"), None);
    }

    #[test]
    fn test_image_version() {
        assert_eq!(
            image_version("opentext/vertica-k8s:24.3.0-0"),
            Some((24, 3, 0))
        );
        assert_eq!(
            image_version("registry.local:5000/vertica-k8s:12.0.4-0"),
            Some((12, 0, 4))
        );
        assert_eq!(image_version("vertica-k8s:latest"), None);
        assert_eq!(image_version("vertica-k8s"), None);
        assert_eq!(image_version("vertica-k8s@sha256:deadbeef"), None);
    }
}
