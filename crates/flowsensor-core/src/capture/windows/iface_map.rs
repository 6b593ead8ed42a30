//! Maps the friendly interface names used in config to the device
//! descriptions the capture library enumerates, tolerating the cosmetic
//! differences between the two (vendor prefixes, "Adapter" suffixes, case).
//!
//! First match wins on ambiguity; callers are expected to log a warning
//! naming the dropped candidates.

/// Strips a leading MAC-address prefix such as `00:1A:2B:3C:4D:5E - ` or
/// `001A2B3C4D5E_` that some enumerations prepend to the device description.
fn strip_mac_prefix(s: &str) -> &str {
    let Some(idx) = s.find(['-', '_']) else {
        return s;
    };
    let candidate = s[..idx].trim();
    let is_hex_pair = |pair: &str| pair.len() == 2 && pair.chars().all(|c| c.is_ascii_hexdigit());
    let octets: Vec<&str> = candidate.split(':').collect();
    if octets.len() == 6 && octets.iter().all(|o| is_hex_pair(o)) {
        s[idx..].trim_start_matches([':', '-', '_', ' '])
    } else {
        s
    }
}

fn normalize(s: &str) -> String {
    let lower = strip_mac_prefix(s).to_lowercase();
    let stripped = lower
        .trim_end_matches(" adapter")
        .trim_end_matches(" network adapter");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Returns the index of the first device description matching `wanted`, if any.
pub fn map_interface_name(wanted: &str, devices: &[String]) -> Option<usize> {
    let target = normalize(wanted);
    devices.iter().position(|d| normalize(d) == target)
}
