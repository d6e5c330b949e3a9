use std::collections::{BTreeMap, HashMap};

use crate::error::{GatewayError, Result};

/// Method-and-prefix dispatch table.
///
/// One prefix tree per HTTP method; lookup returns the handler registered
/// under the longest prefix of the request path. Insertion is atomic per
/// method and duplicates are rejected.
pub struct Dispatcher<T> {
    trees: HashMap<String, BTreeMap<String, T>>,
}

impl<T> Default for Dispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Dispatcher<T> {
    pub fn new() -> Self {
        Self {
            trees: HashMap::new(),
        }
    }

    fn validate(method: &str, prefix: &str) -> Result<()> {
        if method.is_empty() {
            return Err(GatewayError::ConfigInvalid(
                "method must not be empty".into(),
            ));
        }
        if prefix.is_empty() || !prefix.starts_with('/') {
            return Err(GatewayError::ConfigInvalid(format!(
                "prefix {prefix:?} must start with '/'"
            )));
        }
        Ok(())
    }

    /// Register a handler under `(method, prefix)`.
    pub fn add_handler(&mut self, method: &str, prefix: &str, handler: T) -> Result<()> {
        Self::validate(method, prefix)?;
        let method = method.to_uppercase();
        let tree = self.trees.entry(method.clone()).or_default();
        if tree.contains_key(prefix) {
            return Err(GatewayError::Conflict(format!(
                "handler already exists for {method} {prefix}"
            )));
        }
        tree.insert(prefix.to_string(), handler);
        Ok(())
    }

    pub fn remove_handler(&mut self, method: &str, prefix: &str) -> Result<()> {
        Self::validate(method, prefix)?;
        let method = method.to_uppercase();
        let removed = self
            .trees
            .get_mut(&method)
            .and_then(|tree| tree.remove(prefix));
        if removed.is_none() {
            return Err(GatewayError::NotFound(format!(
                "handler for {method} {prefix}"
            )));
        }
        Ok(())
    }

    /// Longest-prefix match of `path` within the method's tree.
    pub fn lookup(&self, method: &str, path: &str) -> Option<&T> {
        let tree = self.trees.get(&method.to_uppercase())?;
        tree.iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, handler)| handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_is_a_conflict() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.add_handler("GET", "/a/", 1).expect("first");
        let err = dispatcher.add_handler("GET", "/a/", 2).expect_err("duplicate");
        assert!(matches!(err, GatewayError::Conflict(_)));
        // the original handler survives
        assert_eq!(dispatcher.lookup("GET", "/a/x"), Some(&1));
    }

    #[test]
    fn longest_prefix_wins() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.add_handler("GET", "/", 0).expect("root");
        dispatcher.add_handler("GET", "/api/", 1).expect("api");
        dispatcher.add_handler("GET", "/api/v2/", 2).expect("api v2");

        assert_eq!(dispatcher.lookup("GET", "/api/v2/users"), Some(&2));
        assert_eq!(dispatcher.lookup("GET", "/api/v1/users"), Some(&1));
        assert_eq!(dispatcher.lookup("GET", "/other"), Some(&0));
    }

    #[test]
    fn methods_are_isolated_and_uppercased() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.add_handler("get", "/a/", 1).expect("insert");
        assert_eq!(dispatcher.lookup("GET", "/a/x"), Some(&1));
        assert_eq!(dispatcher.lookup("POST", "/a/x"), None);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let mut dispatcher: Dispatcher<u8> = Dispatcher::new();
        assert!(dispatcher.add_handler("", "/a/", 1).is_err());
        assert!(dispatcher.add_handler("GET", "a/", 1).is_err());
        assert!(dispatcher.add_handler("GET", "", 1).is_err());
    }

    #[test]
    fn remove_unknown_handler_reports_not_found() {
        let mut dispatcher: Dispatcher<u8> = Dispatcher::new();
        assert!(matches!(
            dispatcher.remove_handler("GET", "/a/"),
            Err(GatewayError::NotFound(_))
        ));
        dispatcher.add_handler("GET", "/a/", 1).expect("insert");
        dispatcher.remove_handler("GET", "/a/").expect("remove");
        assert_eq!(dispatcher.lookup("GET", "/a/x"), None);
    }
}
