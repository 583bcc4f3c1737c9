use crate::store::Route;

/// Maps an incoming host to a route from the global directory.
///
/// An exact host always wins. Otherwise the left-anchored `*.suffix` wildcard
/// with the longest matching suffix wins; a wildcard never matches its bare
/// apex. Disabled routes do not participate.
pub fn match_route<'a>(routes: &'a [Route], host: &str) -> Option<&'a Route> {
    let host = host.to_ascii_lowercase();

    if let Some(exact) = routes
        .iter()
        .filter(|route| route.enabled)
        .find(|route| route.incoming_host == host)
    {
        return Some(exact);
    }

    routes
        .iter()
        .filter(|route| route.enabled)
        .filter_map(|route| {
            let suffix = route.incoming_host.strip_prefix("*.")?;
            wildcard_matches(&host, suffix).then_some((suffix.len(), route))
        })
        .max_by_key(|(suffix_len, _)| *suffix_len)
        .map(|(_, route)| route)
}

/// `*.suffix` semantics: at least one extra label before the suffix.
fn wildcard_matches(host: &str, suffix: &str) -> bool {
    host.strip_suffix(suffix)
        .is_some_and(|prefix| prefix.ends_with('.') && prefix.len() > 1)
}
