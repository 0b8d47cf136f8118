//! Parsed JSON pointers, in the record-patch dialect: `/` addresses the
//! document root, `/foo/0` an array index, and `~0`/`~1` escape `~`/`/`
//! within property names.

/// Token is one step of a parsed pointer.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Token {
    /// Integer index of a JSON array.
    /// Applied to a JSON object, the literal digits serve as a property name.
    Index(usize),
    /// JSON object property name, unescaped. Never a canonical integer.
    Property(String),
}

impl Token {
    fn parse(s: &str) -> Self {
        // "0"-prefixed strings longer than one character are properties,
        // so that every index has exactly one spelling.
        if s.starts_with('+') || (s.starts_with('0') && s.len() > 1) {
            Token::Property(s.to_string())
        } else if let Ok(index) = s.parse::<usize>() {
            Token::Index(index)
        } else {
            Token::Property(s.to_string())
        }
    }

    pub fn as_property(&self) -> std::borrow::Cow<'_, str> {
        match self {
            Token::Index(index) => std::borrow::Cow::Owned(index.to_string()),
            Token::Property(prop) => std::borrow::Cow::Borrowed(prop),
        }
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Index(index) => write!(f, "{index}"),
            Token::Property(prop) => {
                write!(f, "{}", prop.replace('~', "~0").replace('/', "~1"))
            }
        }
    }
}

/// Pointer is a parsed pointer: a (possibly empty) sequence of tokens,
/// where the empty sequence addresses the document root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pointer(pub Vec<Token>);

impl Pointer {
    pub fn root() -> Pointer {
        Pointer(Vec::new())
    }

    pub fn parse(s: &str) -> Pointer {
        if s.is_empty() || s == "/" {
            return Pointer::root();
        }
        Pointer(
            s.split('/')
                .skip(if s.starts_with('/') { 1 } else { 0 })
                .map(|t| Token::parse(&t.replace("~1", "/").replace("~0", "~")))
                .collect(),
        )
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, token: Token) -> &mut Self {
        self.0.push(token);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Token> {
        self.0.iter()
    }
}

impl std::fmt::Display for Pointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for token in &self.0 {
            write!(f, "/{token}")?;
        }
        Ok(())
    }
}

/// Escape one property name as a pointer segment.
pub(crate) fn escape(prop: &str) -> String {
    prop.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod test {
    use super::{Pointer, Token};

    #[test]
    fn parse_and_display_round_trip() {
        let ptr = Pointer::parse("/foo/ba~1ar/3/~0tilde");
        assert_eq!(
            ptr.0,
            vec![
                Token::Property("foo".to_string()),
                Token::Property("ba/ar".to_string()),
                Token::Index(3),
                Token::Property("~tilde".to_string()),
            ]
        );
        assert_eq!(ptr.to_string(), "/foo/ba~1ar/3/~0tilde");
    }

    #[test]
    fn root_spellings() {
        assert!(Pointer::parse("/").is_root());
        assert!(Pointer::parse("").is_root());
        assert_eq!(Pointer::root().to_string(), "/");
    }

    #[test]
    fn ambiguous_indices_are_properties() {
        assert_eq!(
            Pointer::parse("/00").0,
            vec![Token::Property("00".to_string())]
        );
        assert_eq!(
            Pointer::parse("/+1").0,
            vec![Token::Property("+1".to_string())]
        );
        assert_eq!(Pointer::parse("/0").0, vec![Token::Index(0)]);
    }
}
