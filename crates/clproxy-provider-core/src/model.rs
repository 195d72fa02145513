use crate::config::SizeClass;

/// Routes an inbound Claude model name to a size class (spec §4.3).
///
/// Matching is a case-insensitive substring test, checked in this order:
/// `haiku` -> small, `sonnet` -> middle, `opus` -> big, anything else -> big
/// (the safe default, since an unrecognized model is more likely a newer
/// flagship than a small one).
pub fn classify_model(requested_model: &str) -> SizeClass {
    let lower = requested_model.to_ascii_lowercase();
    if lower.contains("haiku") {
        SizeClass::Small
    } else if lower.contains("sonnet") {
        SizeClass::Middle
    } else {
        SizeClass::Big
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_families() {
        assert_eq!(classify_model("claude-3-5-haiku-20241022"), SizeClass::Small);
        assert_eq!(classify_model("claude-3-7-sonnet-20250219"), SizeClass::Middle);
        assert_eq!(classify_model("claude-opus-4-1-20250805"), SizeClass::Big);
    }

    #[test]
    fn is_case_insensitive() {
        assert_eq!(classify_model("CLAUDE-SONNET-4"), SizeClass::Middle);
    }

    #[test]
    fn defaults_unknown_to_big() {
        assert_eq!(classify_model("some-future-model"), SizeClass::Big);
    }
}
