/// The boundary-facing error taxonomy from the external-interfaces contract:
/// a coarse "kind" that a host binding can map onto its own idiomatic error
/// reporting (exception, result, error code), independent of the rich,
/// structured error types each crate raises internally.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum ErrorKind {
    /// A host value has no describable type descriptor: heterogeneous
    /// container under strict inference, an all-null container, or an
    /// unsupported host kind.
    NotSerializable,
    /// An operation on a wview is impossible regardless of types involved:
    /// swap with an ancestor/descendant, insert into a non-container,
    /// erase a tuple below arity 2.
    Api,
    /// `V` does not fit `T`, or has trailing bytes after a complete value
    /// was read.
    ValueMismatch,
    /// `(source_T, target_T)` are structurally incompatible under the
    /// active conversion policy.
    TypeMismatch,
    /// `T` itself is malformed: unknown character, premature end, or a
    /// missing/too-small tuple arity.
    Typestring,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotSerializable => "not_serializable_error",
            ErrorKind::Api => "api_error",
            ErrorKind::ValueMismatch => "value_mismatch_error",
            ErrorKind::TypeMismatch => "type_mismatch_error",
            ErrorKind::Typestring => "typestring_error",
        };
        f.write_str(s)
    }
}

/// Expands `%1`/`%2`/`%e` placeholders in a message template the way the
/// engine's error reconstitution does: `%1` and `%2` become the two
/// supplied type (or value) strings, and `%e` becomes a rendering of a
/// nested sub-error, if any.
pub fn expand_template(template: &str, arg1: &str, arg2: &str, nested: Option<&str>) -> String {
    let mut out = String::with_capacity(template.len() + arg1.len() + arg2.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '%' {
            match chars.peek() {
                Some('1') => {
                    chars.next();
                    out.push_str(arg1);
                }
                Some('2') => {
                    chars.next();
                    out.push_str(arg2);
                }
                Some('e') => {
                    chars.next();
                    if let Some(n) = nested {
                        out.push_str(n);
                    }
                }
                _ => out.push(c),
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_expand_template_basic() {
        let s = expand_template("Cannot set element of <%1> to <%2>.", "t2is", "t2id", None);
        assert_eq!(s, "Cannot set element of <t2is> to <t2id>.");
    }

    #[test]
    fn test_expand_template_nested() {
        let s = expand_template("bad tuple field: %e", "", "", Some("index 2 out of range"));
        assert_eq!(s, "bad tuple field: index 2 out of range");
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::TypeMismatch.to_string(), "type_mismatch_error");
    }
}
