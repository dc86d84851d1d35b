//! Request classifier: decide whether a query name lies inside the
//! delegated zone, and if so how many leading octets form the
//! tunnel-encoded payload.

/// Split `topdomain` (e.g. `"tunnel.example.com"`) into its labels, for
/// repeated case-insensitive comparison against incoming query names.
pub fn topdomain_labels(topdomain: &str) -> Vec<Vec<u8>> {
    topdomain.split('.').map(|l| l.as_bytes().to_vec()).collect()
}

fn labels_eq_ci(a: &[u8], b: &[u8]) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// If `name` ends with `topdomain` label-for-label (case-insensitive),
/// return the byte count of the leading labels that precede it — the
/// tunnel-encoded payload prefix. Otherwise `None`.
///
/// The prefix length is a count of payload octets, not of wire bytes: it
/// sums the label *contents* (excluding the dot separators and the
/// per-label length octets that only exist in the wire encoding), since
/// those are structural and not part of the data a client encoded.
pub fn classify<'a>(name_labels: &'a [Vec<u8>], topdomain: &[Vec<u8>]) -> Option<usize> {
    if topdomain.is_empty() || name_labels.len() < topdomain.len() {
        return None;
    }
    let split = name_labels.len() - topdomain.len();
    let suffix = &name_labels[split..];
    if suffix
        .iter()
        .zip(topdomain.iter())
        .all(|(a, b)| labels_eq_ci(a, b))
    {
        Some(name_labels[..split].iter().map(|l| l.len()).sum())
    } else {
        None
    }
}

/// Concatenate the prefix labels' raw bytes (no separators) into one
/// buffer — this is what the dispatcher treats as the command byte plus
/// encoded remainder.
pub fn prefix_bytes(name_labels: &[Vec<u8>], prefix_label_count: usize) -> Vec<u8> {
    name_labels[..prefix_label_count]
        .iter()
        .flat_map(|l| l.iter().copied())
        .collect()
}

/// Number of leading labels that make up the payload prefix (as opposed to
/// `classify`'s octet count), needed by `prefix_bytes`.
pub fn prefix_label_count(name_labels: &[Vec<u8>], topdomain: &[Vec<u8>]) -> usize {
    name_labels.len().saturating_sub(topdomain.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    #[test]
    fn matches_in_zone_query() {
        let top = topdomain_labels("tunnel.example.com");
        let name = labels(&["abc123", "tunnel", "example", "com"]);
        assert_eq!(classify(&name, &top), Some(6));
    }

    #[test]
    fn is_case_insensitive() {
        let top = topdomain_labels("Tunnel.Example.Com");
        let name = labels(&["abc", "TUNNEL", "example", "COM"]);
        assert_eq!(classify(&name, &top), Some(3));
    }

    #[test]
    fn rejects_out_of_zone_query() {
        let top = topdomain_labels("tunnel.example.com");
        let name = labels(&["www", "google", "com"]);
        assert_eq!(classify(&name, &top), None);
    }

    #[test]
    fn multi_label_prefix_sums_all_leading_labels() {
        let top = topdomain_labels("tunnel.example.com");
        let name = labels(&["aaaa", "bbbb", "tunnel", "example", "com"]);
        assert_eq!(classify(&name, &top), Some(8));
        let count = prefix_label_count(&name, &top);
        assert_eq!(prefix_bytes(&name, count), b"aaaabbbb");
    }
}
