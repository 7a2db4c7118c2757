use std::env;
use std::sync::OnceLock;

static CLCONV_PREFER_LOWERING: OnceLock<Option<bool>> = OnceLock::new();
static CLCONV_LOWERING_THRESHOLD: OnceLock<Option<usize>> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn parse_usize(value: &str) -> Option<usize> {
    value.trim().parse().ok()
}

/// `CLCONV_PREFER_LOWERING` forces the lowering path for channel-minor problems when set.
pub(crate) fn prefer_lowering_override() -> Option<bool> {
    *CLCONV_PREFER_LOWERING.get_or_init(|| match env::var("CLCONV_PREFER_LOWERING") {
        Ok(value) if !value.trim().is_empty() => Some(parse_bool(&value)),
        _ => None,
    })
}

/// `CLCONV_LOWERING_THRESHOLD` replaces the input-channel count at which lowering wins.
pub(crate) fn lowering_threshold_override() -> Option<usize> {
    *CLCONV_LOWERING_THRESHOLD.get_or_init(|| match env::var("CLCONV_LOWERING_THRESHOLD") {
        Ok(value) => parse_usize(&value),
        Err(_) => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_bool(value), "{value:?} should parse as true");
        }
        for value in ["0", "false", "off", "maybe"] {
            assert!(!parse_bool(value), "{value:?} should parse as false");
        }
    }

    #[test]
    fn parse_usize_ignores_garbage() {
        assert_eq!(parse_usize(" 64 "), Some(64));
        assert_eq!(parse_usize("lots"), None);
    }
}
