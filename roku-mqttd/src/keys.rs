use std::collections::HashMap;
use shared::keys::{KeyEntry, KEY_CATALOG};

/// Free-text aliases for the named keys of the remote.
///
/// Built once at startup and only read afterwards.
#[derive(Debug, Clone)]
pub struct KeyAliasTable {
    aliases: HashMap<String, &'static str>,
}

/// Lower-case and drop everything that is not an ASCII letter or digit
pub fn normalize(token: &str) -> String {
    token
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Short form of an alias: `inputhdmi1` -> `hdmi1`, `poweron` -> `on`, `volumemute` -> `mute`
fn short_alias(alias: &str) -> &str {
    if alias == "volumemute" {
        return "mute";
    }
    alias
        .strip_prefix("input")
        .or_else(|| alias.strip_prefix("power"))
        .unwrap_or(alias)
}

impl KeyAliasTable {
    pub fn build() -> Self {
        Self::from_catalog(KEY_CATALOG)
    }

    pub fn from_catalog(catalog: &[KeyEntry]) -> Self {
        let mut aliases = HashMap::new();
        for entry in catalog {
            for name in [entry.key, entry.command, entry.name] {
                let alias = normalize(name);
                let short = short_alias(&alias).to_string();
                if !alias.is_empty() {
                    aliases.insert(alias, entry.command);
                }
                if !short.is_empty() {
                    aliases.insert(short, entry.command);
                }
            }
        }
        tracing::trace!("Built {} key aliases", aliases.len());
        Self { aliases }
    }

    /// Resolve a token to its wire key code
    pub fn lookup(&self, token: &str) -> Option<&'static str> {
        self.aliases.get(&normalize(token)).copied()
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }
}
