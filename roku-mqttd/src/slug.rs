use std::sync::OnceLock;
use regex::Regex;

fn parenthesised() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\([^)]+\)").expect("static regex"))
}

fn non_word() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_]+").expect("static regex"))
}

/// Turn a display name into a topic-safe identifier.
///
/// Parenthesised text is dropped and runs of anything but ASCII letters,
/// digits and `_` collapse into a single `separator`.
pub fn slugify(name: &str, separator: &str) -> String {
    let lower = name.to_lowercase();
    let without_notes = parenthesised().replace_all(&lower, " ");
    let spaced = non_word().replace_all(&without_notes, " ");
    spaced.trim().replace(' ', separator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Living Room", "_"), "living_room");
        assert_eq!(slugify("  Kid's TV (upstairs) ", "-"), "kid-s-tv");
        assert_eq!(slugify("Netflix", "_"), "netflix");
        assert_eq!(slugify("Prime Video: Movies & TV", "_"), "prime_video_movies_tv");
        assert_eq!(slugify("snake_case", "-"), "snake_case");
        assert_eq!(slugify("(hidden)", "_"), "");
    }
}
