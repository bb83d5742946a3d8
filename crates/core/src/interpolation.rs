//! `${VAR}` interpolation for manifest `env` blocks.
//!
//! Supports the following syntax:
//! - `${NAME}` - Reference a variable (plugin `.env` first, then the process environment)
//! - `${env.NAME}` - Same as `${NAME}`
//! - `$$` - Escaped literal `$`

use std::collections::{BTreeMap, HashMap};

use crate::error::{PalisadeError, Result};

/// Context for variable interpolation.
#[derive(Debug, Clone)]
pub struct InterpolationContext {
    /// Variables that shadow the process environment.
    variables: HashMap<String, String>,
    /// Whether to fall back to the process environment.
    use_process_env: bool,
}

impl Default for InterpolationContext {
    fn default() -> Self {
        Self {
            variables: HashMap::new(),
            use_process_env: true,
        }
    }
}

impl InterpolationContext {
    /// Creates a context backed by the process environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context that only sees explicitly added variables.
    pub fn isolated() -> Self {
        Self {
            variables: HashMap::new(),
            use_process_env: false,
        }
    }

    /// Adds a variable to the context.
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Adds multiple variables to the context.
    pub fn with_variables<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.variables
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Looks a name up, preferring explicit variables over the environment.
    pub fn lookup(&self, name: &str) -> Option<String> {
        if let Some(value) = self.variables.get(name) {
            return Some(value.clone());
        }
        if self.use_process_env {
            return std::env::var(name).ok();
        }
        None
    }
}

/// Interpolates variables in a string.
///
/// # Examples
/// ```
/// use palisade_core::interpolation::{interpolate, InterpolationContext};
///
/// let ctx = InterpolationContext::isolated().with_variable("DB_HOST", "db.local");
///
/// let result = interpolate("postgres://${DB_HOST}/app", &ctx).unwrap();
/// assert_eq!(result, "postgres://db.local/app");
/// ```
pub fn interpolate(input: &str, ctx: &InterpolationContext) -> Result<String> {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                result.push('$');
            }
            Some('{') => {
                chars.next();
                let name = parse_name(&mut chars)?;
                let value = ctx
                    .lookup(&name)
                    .ok_or_else(|| PalisadeError::Interpolation {
                        message: format!("Undefined variable: {name}"),
                    })?;
                result.push_str(&value);
            }
            _ => result.push('$'),
        }
    }

    Ok(result)
}

/// Parses a variable name. Expects the opening `{` to have already been consumed.
fn parse_name(chars: &mut std::iter::Peekable<std::str::Chars>) -> Result<String> {
    let mut name = String::new();
    let mut closed = false;

    while let Some(&c) = chars.peek() {
        if c == '}' {
            chars.next();
            closed = true;
            break;
        } else if c.is_alphanumeric() || c == '_' || c == '.' {
            name.push(c);
            chars.next();
        } else {
            return Err(PalisadeError::Interpolation {
                message: format!("Invalid character '{c}' in variable reference"),
            });
        }
    }

    if !closed {
        return Err(PalisadeError::Interpolation {
            message: format!("Unterminated variable reference '${{{name}'"),
        });
    }
    if name.is_empty() {
        return Err(PalisadeError::Interpolation {
            message: "Empty variable reference".to_string(),
        });
    }

    Ok(name
        .strip_prefix("env.")
        .map(str::to_string)
        .unwrap_or(name))
}

/// Interpolates every value of a map.
pub fn interpolate_map(
    map: &BTreeMap<String, String>,
    ctx: &InterpolationContext,
) -> Result<BTreeMap<String, String>> {
    map.iter()
        .map(|(key, value)| Ok((key.clone(), interpolate(value, ctx)?)))
        .collect()
}

/// Checks if a string contains any variable references.
pub fn contains_variables(input: &str) -> bool {
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' {
            match chars.peek() {
                Some('{') => return true,
                Some('$') => {
                    chars.next();
                }
                _ => {}
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_variable() {
        let ctx = InterpolationContext::isolated().with_variable("NAME", "world");
        let result = interpolate("Hello, ${NAME}!", &ctx).unwrap();
        assert_eq!(result, "Hello, world!");
    }

    #[test]
    fn test_env_prefix_alias() {
        let ctx = InterpolationContext::isolated().with_variable("TOKEN", "abc");
        assert_eq!(interpolate("${env.TOKEN}", &ctx).unwrap(), "abc");
    }

    #[test]
    fn test_process_environment() {
        // SAFETY: This is a test, we control the environment
        unsafe {
            std::env::set_var("PALISADE_TEST_INTERP", "from_env");
        }
        let ctx = InterpolationContext::new();
        let result = interpolate("v=${PALISADE_TEST_INTERP}", &ctx).unwrap();
        assert_eq!(result, "v=from_env");
        // SAFETY: This is a test, we control the environment
        unsafe {
            std::env::remove_var("PALISADE_TEST_INTERP");
        }
    }

    #[test]
    fn test_explicit_variables_shadow_environment() {
        // SAFETY: This is a test, we control the environment
        unsafe {
            std::env::set_var("PALISADE_TEST_SHADOW", "process");
        }
        let ctx = InterpolationContext::new().with_variable("PALISADE_TEST_SHADOW", "dotenv");
        assert_eq!(
            interpolate("${PALISADE_TEST_SHADOW}", &ctx).unwrap(),
            "dotenv"
        );
        // SAFETY: This is a test, we control the environment
        unsafe {
            std::env::remove_var("PALISADE_TEST_SHADOW");
        }
    }

    #[test]
    fn test_escaped_dollar() {
        let ctx = InterpolationContext::isolated();
        let result = interpolate("Price: $$100 and $${NOT_A_VAR}", &ctx).unwrap();
        assert_eq!(result, "Price: $100 and ${NOT_A_VAR}");
    }

    #[test]
    fn test_undefined_variable_names_it() {
        let ctx = InterpolationContext::isolated();
        let err = interpolate("${PALISADE_DEFINITELY_MISSING}", &ctx).unwrap_err();
        assert!(err.to_string().contains("PALISADE_DEFINITELY_MISSING"));
    }

    #[test]
    fn test_unterminated_reference() {
        let ctx = InterpolationContext::isolated().with_variable("A", "1");
        assert!(interpolate("${A", &ctx).is_err());
    }

    #[test]
    fn test_contains_variables() {
        assert!(contains_variables("${NAME}"));
        assert!(contains_variables("prefix ${NAME} suffix"));
        assert!(!contains_variables("no variables"));
        assert!(!contains_variables("just a $ sign"));
        assert!(!contains_variables("$${escaped}"));
    }

    #[test]
    fn test_interpolate_map() {
        let ctx = InterpolationContext::isolated().with_variable("HOST", "localhost");
        let mut map = BTreeMap::new();
        map.insert("URL".to_string(), "http://${HOST}:8080".to_string());
        map.insert("STATIC".to_string(), "plain".to_string());
        let result = interpolate_map(&map, &ctx).unwrap();
        assert_eq!(result["URL"], "http://localhost:8080");
        assert_eq!(result["STATIC"], "plain");
    }
}
