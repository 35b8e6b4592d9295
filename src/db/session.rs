use std::collections::HashMap;
use std::env;

/// SQLCMD scripting variables defined through `:setvar` or supplied by the
/// host before the run. Names are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct VariableTable {
    values: HashMap<String, String>,
}

impl VariableTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn normalize_name(name: &str) -> String {
        name.trim().to_uppercase()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(&Self::normalize_name(name))
            .map(String::as_str)
    }

    /// Upsert the value, or remove the entry when `value` is `None`.
    pub fn set(&mut self, name: &str, value: Option<&str>) {
        let key = Self::normalize_name(name);
        match value {
            Some(value) => {
                self.values.insert(key, value.to_string());
            }
            None => {
                self.values.remove(&key);
            }
        }
    }

    pub fn merge<'a, I>(&mut self, variables: I)
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (name, value) in variables {
            self.set(name, Some(value));
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Table entry first, then the process environment.
    pub fn resolve(&self, name: &str) -> Option<String> {
        if let Some(value) = self.get(name) {
            return Some(value.to_string());
        }
        environment_variable(name)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn environment_variable(name: &str) -> Option<String> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    if let Ok(value) = env::var(name) {
        return Some(value);
    }
    env::vars()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}
