/// Number of positions separating `peer` and `local` in `order`, positive
/// when `local` comes after `peer`. Wrap-around rule: when `peer` is last and
/// `local` is first the distance is 1, as if `local` followed directly.
///
/// `order` is expected to be the replica priority list already filtered to
/// live replicas plus the two endpoints; `None` when either endpoint is
/// missing from it.
pub fn replica_distance(peer: &str, local: &str, order: &[String]) -> Option<i64> {
    let peer_pos = order.iter().position(|s| s == peer)?;
    let local_pos = order.iter().position(|s| s == local)?;

    if peer_pos == order.len() - 1 && local_pos == 0 {
        return Some(1);
    }
    Some(local_pos as i64 - peer_pos as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn order(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[rstest]
    #[case(&["a", "b", "c"], "a", "b", Some(1))]
    #[case(&["a", "b", "c"], "a", "c", Some(2))]
    #[case(&["a", "b", "c"], "b", "a", Some(-1))]
    #[case(&["a", "b"], "a", "a", Some(0))]
    fn distance_follows_list_positions(
        #[case] ids: &[&str],
        #[case] peer: &str,
        #[case] local: &str,
        #[case] expected: Option<i64>,
    ) {
        assert_eq!(replica_distance(peer, local, &order(ids)), expected);
    }

    #[test]
    fn wraps_around_when_peer_is_last_and_local_is_first() {
        assert_eq!(replica_distance("c", "a", &order(&["a", "b", "c"])), Some(1));
        // but not when local is merely earlier
        assert_eq!(replica_distance("c", "b", &order(&["a", "b", "c"])), Some(-1));
    }

    #[test]
    fn missing_endpoint_yields_none() {
        assert_eq!(replica_distance("x", "a", &order(&["a", "b"])), None);
        assert_eq!(replica_distance("a", "x", &order(&["a", "b"])), None);
        assert_eq!(replica_distance("a", "b", &[]), None);
    }
}
