use crate::config::ConfigError;
use crate::resolve::ResolutionError;

/// Rewrites `alias/*` import specifiers into real relative paths under the
/// source root.
///
/// Matching is first-configured-match, not longest-match; overlapping alias
/// prefixes would make the winner order-dependent, so they are rejected at
/// construction.
pub struct PathAliasResolver {
    /// (stripped alias prefix, stripped replacement prefix), config order.
    alias_list: Vec<(String, String)>,
}

impl PathAliasResolver {
    /// Validates alias shape eagerly: keys must end with `/*`, values must
    /// start with `./` and end with `/*`, and no stripped key may be a
    /// prefix of another.
    pub fn new(path_aliases: &[(String, String)]) -> Result<Self, ConfigError> {
        for (key, value) in path_aliases {
            if !key.ends_with("/*") {
                return Err(ConfigError::InvalidAliasKey(key.clone()));
            }
            if !value.starts_with("./") || !value.ends_with("/*") {
                return Err(ConfigError::InvalidAliasValue {
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }

        let alias_list: Vec<(String, String)> = path_aliases
            .iter()
            .map(|(key, value)| {
                let pattern = key.trim_end_matches("/*").to_string();
                let replacement = value
                    .trim_end_matches("/*")
                    .trim_start_matches("./")
                    .to_string();
                (pattern, replacement)
            })
            .collect();

        for (i, (first, _)) in alias_list.iter().enumerate() {
            for (second, _) in alias_list.iter().skip(i + 1) {
                if first.starts_with(second.as_str()) || second.starts_with(first.as_str()) {
                    return Err(ConfigError::AmbiguousAlias {
                        first: first.clone(),
                        second: second.clone(),
                    });
                }
            }
        }

        Ok(Self { alias_list })
    }

    fn alias_for(&self, specifier: &str) -> Option<&(String, String)> {
        self.alias_list
            .iter()
            .find(|(pattern, _)| specifier.starts_with(pattern.as_str()))
    }

    pub fn is_alias(&self, specifier: &str) -> bool {
        self.alias_for(specifier).is_some()
    }

    /// Expand an aliased specifier to a source-root-relative path.
    pub fn replace_alias_pattern(&self, specifier: &str) -> Result<String, ResolutionError> {
        let (pattern, replacement) = self
            .alias_for(specifier)
            .ok_or_else(|| ResolutionError::NoAliasFor(specifier.to_string()))?;
        Ok(format!("{replacement}{}", &specifier[pattern.len()..]))
    }
}
