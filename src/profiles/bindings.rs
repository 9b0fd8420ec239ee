use std::collections::HashMap;

/// In-memory `session_id -> profile_id` associations. Not persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionBindings {
    bindings: HashMap<String, String>,
}

impl SessionBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty session or profile ids are ignored.
    pub fn set(&mut self, session_id: &str, profile_id: &str) {
        if session_id.is_empty() || profile_id.is_empty() {
            return;
        }
        self.bindings
            .insert(session_id.to_string(), profile_id.to_string());
    }

    /// Bound profile id, or an empty string.
    pub fn get(&self, session_id: &str) -> String {
        self.bindings.get(session_id).cloned().unwrap_or_default()
    }

    /// Removes the binding and returns the previously bound id, or an empty string.
    pub fn clear(&mut self, session_id: &str) -> String {
        self.bindings.remove(session_id).unwrap_or_default()
    }

    /// Removes every binding to `profile_id`; returns how many were removed.
    pub fn clear_for_profile(&mut self, profile_id: &str) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|_, bound| bound != profile_id);
        before - self.bindings.len()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ids_are_ignored() {
        let mut bindings = SessionBindings::new();
        bindings.set("", "prof-1");
        bindings.set("sess-1", "");
        assert!(bindings.is_empty());
    }

    #[test]
    fn clear_returns_previous_binding_once() {
        let mut bindings = SessionBindings::new();
        bindings.set("sess-1", "prof-1");
        assert_eq!(bindings.get("sess-1"), "prof-1");
        assert_eq!(bindings.clear("sess-1"), "prof-1");
        assert_eq!(bindings.clear("sess-1"), "");
    }

    #[test]
    fn clear_for_profile_only_touches_matching_sessions() {
        let mut bindings = SessionBindings::new();
        bindings.set("a", "prof-1");
        bindings.set("b", "prof-1");
        bindings.set("c", "prof-2");
        assert_eq!(bindings.clear_for_profile("prof-1"), 2);
        assert_eq!(bindings.get("a"), "");
        assert_eq!(bindings.get("c"), "prof-2");
    }
}
