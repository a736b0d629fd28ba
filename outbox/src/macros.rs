//! Convenience macros for working with the outbox.

/// Build a [`ContextMap`](crate::ContextMap) from literal entries.
///
/// # Usage
///
/// ```rust
/// use outbox::outbox_context;
///
/// let context = outbox_context! {
///     "tenant" => "acme",
///     "source" => "checkout-api",
/// };
/// assert_eq!(context.get("tenant").map(String::as_str), Some("acme"));
///
/// let empty = outbox_context! {};
/// assert!(empty.is_empty());
/// ```
#[macro_export]
macro_rules! outbox_context {
    () => {
        $crate::ContextMap::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut context = $crate::ContextMap::new();
        $(
            context.insert($key.to_string(), $value.to_string());
        )+
        context
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    fn builds_a_map_from_entries() {
        let context = outbox_context! {
            "tenant" => "acme",
            "attempt" => 1,
        };
        assert_eq!(context.len(), 2);
        assert_eq!(context.get("attempt").map(String::as_str), Some("1"));
    }

    #[test]
    fn empty_invocation_builds_an_empty_map() {
        let context = outbox_context! {};
        assert!(context.is_empty());
    }
}
