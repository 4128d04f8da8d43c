//! Request routing: which action does a public request map to?
//!
//! Precedence is load-bearing and must not be reordered:
//! 1. root path or a `new` query parameter asks for a fresh tunnel
//! 2. a registered Host-subdomain identifier is proxied
//! 3. a leading path segment claims that identifier for a new tunnel
//! 4. an unregistered Host-subdomain identifier re-allocates itself,
//!    which is what lets a client reconnect to its old subdomain
//! 5. anything else is not found

/// Resolved action for one public request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Allocate a tunnel, optionally under a requested identifier
    NewTunnel(Option<String>),
    /// Forward to the registered client
    Proxy(String),
    NotFound,
}

/// Decide the action for a request, given its path-and-query, its Host
/// header value, and a registry lookup.
pub fn route<F>(path_and_query: &str, host: &str, is_registered: F) -> Action
where
    F: Fn(&str) -> bool,
{
    if is_new_tunnel_request(path_and_query) {
        return Action::NewTunnel(None);
    }

    let host_id = host_identifier(host);
    if let Some(id) = &host_id {
        if is_registered(id) {
            return Action::Proxy(id.clone());
        }
    }

    if let Some(id) = path_identifier(path_and_query) {
        return Action::NewTunnel(Some(id));
    }

    if let Some(id) = host_id {
        return Action::NewTunnel(Some(id));
    }

    Action::NotFound
}

/// `/`, `/?new`, or any query carrying a `new` parameter
fn is_new_tunnel_request(path_and_query: &str) -> bool {
    if path_and_query == "/" {
        return true;
    }
    let Some((_, query)) = path_and_query.split_once('?') else {
        return false;
    };
    query
        .split('&')
        .any(|pair| pair == "new" || pair.starts_with("new="))
}

/// Leading `[a-z0-9]+` subdomain label of the Host header, if any.
/// Requires at least one more label after the dot; a port suffix is ignored.
fn host_identifier(host: &str) -> Option<String> {
    let name = host.split(':').next().unwrap_or(host);
    let (label, rest) = name.split_once('.')?;
    if rest.is_empty() || !crate::id::validate(label) {
        return None;
    }
    Some(label.to_string())
}

/// First path segment when it is a bare `[a-z0-9]+` identifier,
/// i.e. `/{id}` or `/{id}/...` but not `/{id}?...` or `/{id}.ext`
fn path_identifier(path_and_query: &str) -> Option<String> {
    let rest = path_and_query.strip_prefix('/')?;
    let end = rest
        .find(|c: char| !(c.is_ascii_lowercase() || c.is_ascii_digit()))
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    match rest.as_bytes().get(end) {
        None | Some(b'/') => Some(rest[..end].to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered<'a>(ids: &'a [&'a str]) -> impl Fn(&str) -> bool + 'a {
        move |id| ids.contains(&id)
    }

    #[test]
    fn test_root_path_allocates() {
        assert_eq!(
            route("/", "example.com", registered(&[])),
            Action::NewTunnel(None)
        );
    }

    #[test]
    fn test_new_query_allocates() {
        assert_eq!(
            route("/?new", "example.com", registered(&[])),
            Action::NewTunnel(None)
        );
        assert_eq!(
            route("/index?new=1", "example.com", registered(&[])),
            Action::NewTunnel(None)
        );
        assert_eq!(
            route("/path?a=1&new", "example.com", registered(&[])),
            Action::NewTunnel(None)
        );
    }

    #[test]
    fn test_new_must_be_a_parameter() {
        // "new" embedded in another key or value is not an allocation
        assert_eq!(
            route("/x?renew=1", "localhost", registered(&[])),
            Action::NotFound
        );
    }

    #[test]
    fn test_root_wins_over_registered_host() {
        // A new-tunnel request is never proxied, even from a tunnel subdomain
        assert_eq!(
            route("/", "abcd.example.com", registered(&["abcd"])),
            Action::NewTunnel(None)
        );
    }

    #[test]
    fn test_registered_host_proxies() {
        assert_eq!(
            route("/hello", "abcd.example.com", registered(&["abcd"])),
            Action::Proxy("abcd".to_string())
        );
        assert_eq!(
            route("/hello", "abcd.example.com:8080", registered(&["abcd"])),
            Action::Proxy("abcd".to_string())
        );
    }

    #[test]
    fn test_registered_host_wins_over_path_identifier() {
        // "/wxyz" is a proxied path on abcd's tunnel, not a new tunnel
        assert_eq!(
            route("/wxyz", "abcd.example.com", registered(&["abcd"])),
            Action::Proxy("abcd".to_string())
        );
    }

    #[test]
    fn test_path_identifier_requests_tunnel() {
        assert_eq!(
            route("/abcd", "example.com", registered(&[])),
            Action::NewTunnel(Some("abcd".to_string()))
        );
        assert_eq!(
            route("/abcd/", "example.com", registered(&[])),
            Action::NewTunnel(Some("abcd".to_string()))
        );
    }

    #[test]
    fn test_path_identifier_must_be_bare_segment() {
        assert_eq!(
            route("/abcd?x=1", "localhost", registered(&[])),
            Action::NotFound
        );
        assert_eq!(
            route("/favicon.ico", "localhost", registered(&[])),
            Action::NotFound
        );
        assert_eq!(
            route("/ABCD", "localhost", registered(&[])),
            Action::NotFound
        );
    }

    #[test]
    fn test_unregistered_host_reallocates() {
        // Reconnect flow: a well-formed but unregistered subdomain asks for
        // that identifier back instead of 404ing
        assert_eq!(
            route("/anything!", "wxyz.example.com", registered(&[])),
            Action::NewTunnel(Some("wxyz".to_string()))
        );
    }

    #[test]
    fn test_path_identifier_wins_over_unregistered_host() {
        assert_eq!(
            route("/abcd", "wxyz.example.com", registered(&[])),
            Action::NewTunnel(Some("abcd".to_string()))
        );
    }

    #[test]
    fn test_not_found() {
        assert_eq!(route("/x_y", "localhost", registered(&[])), Action::NotFound);
        assert_eq!(
            route("/x_y", "localhost:8080", registered(&[])),
            Action::NotFound
        );
        assert_eq!(route("//double", "", registered(&[])), Action::NotFound);
    }

    #[test]
    fn test_host_identifier_edge_cases() {
        assert_eq!(host_identifier("abcd.example.com"), Some("abcd".to_string()));
        assert_eq!(
            host_identifier("a1b2.example.com:8080"),
            Some("a1b2".to_string())
        );
        assert_eq!(host_identifier("localhost"), None);
        assert_eq!(host_identifier("localhost:8080"), None);
        assert_eq!(host_identifier("ABCD.example.com"), None);
        assert_eq!(host_identifier(".example.com"), None);
        assert_eq!(host_identifier("abcd."), None);
        assert_eq!(host_identifier(""), None);
    }
}
