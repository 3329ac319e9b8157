//! Reserved keys and key pattern matching.
//!
//! The engine treats caller keys as opaque strings. The only keys it owns
//! are the markers below, all under the `cache:` namespace.

use std::time::Duration;

/// Namespace of engine-owned keys.
pub const NAMESPACE: &str = "cache";

/// Warm-up marker: `cache:warmed_up`.
pub const WARMED_UP_KEY: &str = "cache:warmed_up";

/// Capped invalidation event log: `cache:invalidation_events`.
pub const INVALIDATION_EVENTS_KEY: &str = "cache:invalidation_events";

/// Lifetime of the warm-up marker.
pub const WARMED_UP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Lifetime of a mirrored dependency set.
pub const DEPENDENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Lifetime of the invalidation event log.
pub const EVENTS_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Builds engine marker keys.
pub struct MarkerKey;

impl MarkerKey {
    /// `cache:dependency:<key>`
    pub fn dependency(key: &str) -> String {
        format!("{}:dependency:{}", NAMESPACE, key)
    }

    /// `cache:tag:<tag>`
    pub fn tag(tag: &str) -> String {
        format!("{}:tag:{}", NAMESPACE, tag)
    }

    /// Pattern matching every tag set.
    pub fn tag_pattern() -> String {
        format!("{}:tag:*", NAMESPACE)
    }
}

/// Match `key` against a Redis-style glob pattern.
///
/// Supports `*`, `?`, `[abc]`, `[a-z]`, `[^a]` and `\` escapes, which is
/// the subset `SCAN MATCH` understands.
pub fn matches_pattern(pattern: &str, key: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let k: Vec<char> = key.chars().collect();
    glob(&p, &k)
}

fn glob(p: &[char], k: &[char]) -> bool {
    let (mut pi, mut ki) = (0, 0);
    // Backtrack point for the last `*`.
    let mut star: Option<(usize, usize)> = None;

    while ki < k.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi, ki));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ki += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, next)) = match_class(p, pi, k[ki]) {
                        if matched {
                            pi = next;
                            ki += 1;
                            continue;
                        }
                    }
                }
                '\\' if pi + 1 < p.len() => {
                    if p[pi + 1] == k[ki] {
                        pi += 2;
                        ki += 1;
                        continue;
                    }
                }
                c if c == k[ki] => {
                    pi += 1;
                    ki += 1;
                    continue;
                }
                _ => {}
            }
        }

        match star {
            Some((sp, sk)) => {
                pi = sp + 1;
                ki = sk + 1;
                star = Some((sp, sk + 1));
            }
            None => return false,
        }
    }

    p[pi..].iter().all(|c| *c == '*')
}

/// Evaluate a `[...]` class starting at `p[start]`.
///
/// Returns whether `c` matched and the index just past the closing `]`,
/// or `None` for an unterminated class.
fn match_class(p: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = p.get(i) == Some(&'^');
    if negate {
        i += 1;
    }

    let mut matched = false;
    while i < p.len() && p[i] != ']' {
        if p[i] == '\\' && i + 1 < p.len() {
            matched |= p[i + 1] == c;
            i += 2;
        } else if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            let (lo, hi) = if p[i] <= p[i + 2] {
                (p[i], p[i + 2])
            } else {
                (p[i + 2], p[i])
            };
            matched |= lo <= c && c <= hi;
            i += 3;
        } else {
            matched |= p[i] == c;
            i += 1;
        }
    }

    if i >= p.len() {
        return None;
    }
    Some((matched != negate, i + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_marker_keys() {
        assert_eq!(MarkerKey::dependency("user:1"), "cache:dependency:user:1");
        assert_eq!(MarkerKey::tag("users"), "cache:tag:users");
        assert_eq!(MarkerKey::tag_pattern(), "cache:tag:*");
    }

    #[test]
    fn test_glob_basics() {
        assert!(matches_pattern("user:*", "user:1"));
        assert!(matches_pattern("user:*", "user:"));
        assert!(!matches_pattern("user:*", "profile:1"));
        assert!(matches_pattern("h?llo", "hello"));
        assert!(!matches_pattern("h?llo", "hllo"));
        assert!(matches_pattern("*:session", "user:1:session"));
        assert!(matches_pattern("a*b*c", "axxbyyc"));
        assert!(!matches_pattern("a*b*c", "axxbyy"));
    }

    #[test]
    fn test_glob_classes_and_escapes() {
        assert!(matches_pattern("h[ae]llo", "hallo"));
        assert!(!matches_pattern("h[ae]llo", "hillo"));
        assert!(matches_pattern("h[^e]llo", "hallo"));
        assert!(!matches_pattern("h[^e]llo", "hello"));
        assert!(matches_pattern("key[0-9]", "key7"));
        assert!(!matches_pattern("key[0-9]", "keyx"));
        assert!(matches_pattern("lit\\*", "lit*"));
        assert!(!matches_pattern("lit\\*", "litx"));
    }

    proptest! {
        #[test]
        fn prop_star_matches_everything(key in "[a-z0-9:]{0,24}") {
            prop_assert!(matches_pattern("*", &key));
        }

        #[test]
        fn prop_prefix_pattern_matches_prefixed_keys(
            prefix in "[a-z]{1,8}",
            rest in "[a-z0-9:]{0,16}",
        ) {
            let pattern = format!("{}:*", prefix);
            let key = format!("{}:{}", prefix, rest);
            prop_assert!(matches_pattern(&pattern, &key));
        }

        #[test]
        fn prop_literal_pattern_matches_only_itself(a in "[a-z]{1,10}", b in "[a-z]{1,10}") {
            prop_assert_eq!(matches_pattern(&a, &b), a == b);
        }
    }
}
