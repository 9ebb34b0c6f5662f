//! `${...}` template interpolation.

use std::collections::BTreeMap;

/// Interpolate `${key}` references in `src` against the given environments.
///
/// Environments are consulted in order and the first one holding the key
/// wins. Unknown keys interpolate to the empty string. Text outside
/// well-formed `${...}` references is copied verbatim.
pub fn interpolate(src: &str, envs: &[&BTreeMap<String, String>]) -> String {
    let mut out = String::with_capacity(src.len());
    let mut rest = src;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let key = &rest[start + 2..start + 2 + end];
                if let Some(value) = envs.iter().find_map(|env| env.get(key)) {
                    out.push_str(value);
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                // unterminated reference: keep the tail as-is
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
