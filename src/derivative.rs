use thiserror::Error;

/// Output widths a derivative may have. Every cached object uses one of these.
pub const CANONICAL_WIDTHS: [u32; 6] = [512, 1024, 1536, 2048, 3072, 4096];
pub const MIN_REQUEST_WIDTH: i64 = 320;
pub const MAX_REQUEST_WIDTH: i64 = 4096;
pub const DEFAULT_WIDTH: u32 = 2048;
const MAX_SLUG_LEN: usize = 100;

#[derive(Debug, Error)]
pub enum DerivativeInputError {
    #[error("invalid slug")]
    InvalidSlug,
}

/// Slugs are `^[a-z0-9-]{1,100}$`.
pub fn validate_slug(slug: &str) -> Result<&str, DerivativeInputError> {
    if slug.is_empty() || slug.len() > MAX_SLUG_LEN {
        return Err(DerivativeInputError::InvalidSlug);
    }
    if !slug
        .bytes()
        .all(|byte| byte.is_ascii_lowercase() || byte.is_ascii_digit() || byte == b'-')
    {
        return Err(DerivativeInputError::InvalidSlug);
    }
    Ok(slug)
}

/// Parses the raw `w` query value. Anything that is not an integer yields the
/// default width; values far outside `i64` are saturated so they still clamp.
pub fn parse_width_param(raw: Option<&str>) -> i64 {
    let Some(raw) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
        return DEFAULT_WIDTH as i64;
    };
    match raw.parse::<i64>() {
        Ok(value) => value,
        Err(_) => {
            let digits = raw.strip_prefix('-').unwrap_or(raw);
            if !digits.is_empty() && digits.bytes().all(|byte| byte.is_ascii_digit()) {
                if raw.starts_with('-') { i64::MIN } else { i64::MAX }
            } else {
                DEFAULT_WIDTH as i64
            }
        }
    }
}

/// Ceiling-to-bucket: clamp into the allowed request range, then take the
/// smallest canonical width that is at least the clamped value.
pub fn quantize_width(requested: i64) -> u32 {
    let clamped = requested.clamp(MIN_REQUEST_WIDTH, MAX_REQUEST_WIDTH);
    CANONICAL_WIDTHS
        .iter()
        .copied()
        .find(|width| i64::from(*width) >= clamped)
        .unwrap_or(CANONICAL_WIDTHS[CANONICAL_WIDTHS.len() - 1])
}

pub fn resolve_width(raw: Option<&str>) -> u32 {
    quantize_width(parse_width_param(raw))
}

/// Cache object name for a derivative. Bump `template_version` whenever the
/// watermark's look changes; objects under old names are never rewritten.
pub fn derivative_blob_name(slug: &str, width: u32, template_version: u32) -> String {
    format!("{slug}_wm_{width}_v{template_version}.jpg")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_rounds_up_to_bucket() {
        assert_eq!(quantize_width(1000), 1024);
        assert_eq!(quantize_width(1024), 1024);
        assert_eq!(quantize_width(1025), 1536);
        assert_eq!(quantize_width(2048), 2048);
        assert_eq!(quantize_width(2049), 3072);
        assert_eq!(quantize_width(4000), 4096);
    }

    #[test]
    fn quantize_clamps_out_of_range() {
        assert_eq!(quantize_width(0), 512);
        assert_eq!(quantize_width(-50), 512);
        assert_eq!(quantize_width(320), 512);
        assert_eq!(quantize_width(100_000), 4096);
        assert_eq!(quantize_width(i64::MIN), 512);
        assert_eq!(quantize_width(i64::MAX), 4096);
    }

    #[test]
    fn quantize_is_monotonic_and_canonical() {
        let mut previous = 0u32;
        for requested in -100i64..=5000 {
            let width = quantize_width(requested);
            assert!(CANONICAL_WIDTHS.contains(&width), "{requested} -> {width}");
            assert!(width >= previous, "{requested} regressed to {width}");
            previous = width;
        }
    }

    #[test]
    fn width_param_defaults() {
        assert_eq!(parse_width_param(None), 2048);
        assert_eq!(parse_width_param(Some("")), 2048);
        assert_eq!(parse_width_param(Some("abc")), 2048);
        assert_eq!(parse_width_param(Some("12.5")), 2048);
        assert_eq!(parse_width_param(Some(" 700 ")), 700);
        assert_eq!(resolve_width(Some("99999999999999999999999")), 4096);
        assert_eq!(resolve_width(Some("-99999999999999999999999")), 512);
        assert_eq!(resolve_width(None), 2048);
    }

    #[test]
    fn blob_name_format() {
        assert_eq!(
            derivative_blob_name("sample-photo", 1024, 1),
            "sample-photo_wm_1024_v1.jpg"
        );
        let base = derivative_blob_name("a", 512, 1);
        assert_eq!(base, derivative_blob_name("a", 512, 1));
        assert_ne!(base, derivative_blob_name("b", 512, 1));
        assert_ne!(base, derivative_blob_name("a", 1024, 1));
        assert_ne!(base, derivative_blob_name("a", 512, 2));
    }

    #[test]
    fn slug_validation() {
        assert!(validate_slug("sample-photo").is_ok());
        assert!(validate_slug("a1-b2").is_ok());
        assert!(validate_slug(&"a".repeat(100)).is_ok());
        assert!(validate_slug(&"a".repeat(101)).is_err());
        assert!(validate_slug("").is_err());
        assert!(validate_slug("UPPERCASE").is_err());
        assert!(validate_slug("../etc").is_err());
        assert!(validate_slug("with space").is_err());
        assert!(validate_slug("under_score").is_err());
        assert!(validate_slug("caf\u{e9}").is_err());
    }
}
