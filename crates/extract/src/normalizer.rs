use regex::Regex;
use std::sync::LazyLock;

static PUNCTUATION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"[.,!?;:'"`]"#).expect("valid regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));
static CAMEL_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([a-z0-9])([A-Z])").expect("valid regex"));
static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("valid regex"));

/// Property names the store uses for its own bookkeeping.
pub const RESERVED_PROPERTY_KEYS: &[&str] = &["id", "key", "chunk_ids", "source", "embedding"];

/// Deterministic entity-id normalization. Two mentions are the same entity
/// exactly when their types match and their normalized ids match.
#[derive(Debug, Clone, Default)]
pub struct EntityNormalizer;

impl EntityNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Identity key: lowercase, punctuation removed, whitespace collapsed
    pub fn normalize(&self, name: &str) -> String {
        let lowered = name.to_lowercase();
        let stripped = PUNCTUATION.replace_all(lowered.trim(), "");
        WHITESPACE.replace_all(stripped.trim(), " ").to_string()
    }

    /// Surface form kept on the node: trimmed with whitespace collapsed
    pub fn display_id(&self, name: &str) -> String {
        WHITESPACE.replace_all(name.trim(), " ").to_string()
    }

    /// Convert a model-proposed property name into a `snake_case` identifier.
    /// Returns `None` for names that cannot be made into one or that collide
    /// with reserved bookkeeping keys.
    pub fn property_key(&self, key: &str) -> Option<String> {
        let split = CAMEL_BOUNDARY.replace_all(key.trim(), "${1}_${2}");
        let lowered = split.to_lowercase();
        let snake = NON_WORD.replace_all(&lowered, "_");
        let snake = snake.trim_matches('_');

        if snake.is_empty() || snake.starts_with(|c: char| c.is_ascii_digit()) {
            return None;
        }
        if RESERVED_PROPERTY_KEYS.contains(&snake) {
            return None;
        }
        Some(snake.to_string())
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}
