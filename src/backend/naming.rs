use std::collections::HashMap;

/// Name-scope stack and per-prefix unique-id counters for one backend context.
#[derive(Debug, Clone, Default)]
pub(crate) struct Naming {
    scopes: Vec<String>,
    uids: HashMap<String, u64>,
}

impl Naming {
    pub(crate) fn push_scope(&mut self, name: &str) {
        self.scopes.push(name.to_string());
    }

    pub(crate) fn pop_scope(&mut self) -> Option<String> {
        self.scopes.pop()
    }

    /// Counters start at 1 for each fresh prefix.
    pub(crate) fn next_uid(&mut self, prefix: &str) -> u64 {
        let uid = self.uids.entry(prefix.to_string()).or_insert(0);
        *uid += 1;
        *uid
    }

    pub(crate) fn reset_uids(&mut self) {
        self.uids.clear();
    }

    /// `scope_name` for an explicit name, otherwise `scope_default_<uid>`.
    pub(crate) fn prepend_scope(&mut self, name: Option<&str>, default: &str) -> String {
        match name {
            Some(name) if !name.is_empty() => self.join(name),
            _ => {
                let prefix = self.join(default);
                let uid = self.next_uid(&prefix);
                format!("{}_{}", prefix, uid)
            }
        }
    }

    fn join(&self, name: &str) -> String {
        self.scopes
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(name))
            .collect::<Vec<_>>()
            .join("_")
    }
}
